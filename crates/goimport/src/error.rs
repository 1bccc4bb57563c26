use loupe_store::Issue;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type for import operations
pub type Result<T> = std::result::Result<T, ImportError>;

/// Errors produced while resolving, parsing or checking a package.
///
/// The type is `Clone` because a failed import is cached and handed to every
/// later caller of the same package.
#[derive(Error, Debug, Clone)]
pub enum ImportError {
    /// The importer chain leads back to a package being imported
    #[error("import cycle: {0}")]
    Cycle(String),

    /// The directory holds no buildable Go files
    #[error("no buildable Go source files in {}", .0.display())]
    NoGo(PathBuf),

    /// The import path could not be resolved to a directory
    #[error("{0}")]
    NotFound(String),

    /// The cached package was never completed
    #[error("reimported partially imported package {0:?}")]
    Partial(String),

    /// Only mode 0 is supported
    #[error("unsupported import mode {0}")]
    Mode(u32),

    #[error("srcDir is not absolute: {}", .0.display())]
    SrcDirNotAbsolute(PathBuf),

    /// A dependency failed; positioned at the import spec that named it
    #[error("{source}")]
    Import {
        path: PathBuf,
        row: usize,
        col: usize,
        source: Box<ImportError>,
    },

    /// Syntax error in a source file
    #[error("{}:{}:{}: {message}", .path.display(), .row + 1, .col + 1)]
    Parse {
        path: PathBuf,
        row: usize,
        col: usize,
        message: String,
    },

    /// First hard error reported by the type checker
    #[error("{}:{}:{}: {message}", .path.display(), .row + 1, .col + 1)]
    Check {
        path: PathBuf,
        row: usize,
        col: usize,
        message: String,
    },

    /// The cgo export-data fallback failed
    #[error("{0}")]
    Cgo(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(Arc::new(err))
    }
}

impl From<loupe_vfs::VfsError> for ImportError {
    fn from(err: loupe_vfs::VfsError) -> Self {
        match err {
            loupe_vfs::VfsError::IoError(e) => Self::IoError(Arc::new(e)),
            other => Self::Other(other.to_string()),
        }
    }
}

impl ImportError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True for cycles, including a dependency's cycle seen through its
    /// import spec.
    pub fn is_cycle(&self) -> bool {
        match self {
            Self::Cycle(_) => true,
            Self::Import { source, .. } => source.is_cycle(),
            _ => false,
        }
    }

    /// Converts positioned errors into an editor issue.
    pub fn issue(&self) -> Option<Issue> {
        let (path, row, col, message) = match self {
            Self::Import {
                path,
                row,
                col,
                source,
            } => (path, *row, *col, source.to_string()),
            Self::Parse {
                path,
                row,
                col,
                message,
            }
            | Self::Check {
                path,
                row,
                col,
                message,
            } => (path, *row, *col, message.clone()),
            _ => return None,
        };
        let mut issue = Issue::error(message);
        issue.path = path.display().to_string();
        issue.row = row;
        issue.col = col;
        Some(issue)
    }
}
