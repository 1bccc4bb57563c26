use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("path `{}` is not absolute", .0.display())]
    NotAbsolute(PathBuf),

    #[error("`{}` does not exist", .0.display())]
    NotExist(PathBuf),

    #[error("`{}` is not a directory", .0.display())]
    NotDir(PathBuf),

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    pub fn is_not_exist(&self) -> bool {
        match self {
            Self::NotExist(_) => true,
            Self::IoError(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
