use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::error::{ImportError, Result};
use crate::parse::ParsedFile;

/// A checked package as seen by its importers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Package {
    pub path: String,
    pub name: String,
    pub complete: bool,
    pub imports: Vec<Arc<Package>>,
    pub files: Vec<PathBuf>,
    /// Names declared at package level.
    pub scope: BTreeSet<String>,
}

impl Package {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// The built-in `unsafe` package.
    pub fn unsafe_pkg() -> Arc<Package> {
        static UNSAFE: OnceLock<Arc<Package>> = OnceLock::new();
        UNSAFE
            .get_or_init(|| {
                let mut p = Package::new("unsafe", "unsafe");
                p.scope = [
                    "Add", "Alignof", "Offsetof", "Pointer", "Sizeof", "Slice", "SliceData",
                    "String", "StringData",
                ]
                .into_iter()
                .map(String::from)
                .collect();
                p.mark_complete();
                Arc::new(p)
            })
            .clone()
    }

    /// The opaque stand-in for cgo's `C` pseudo-package.
    pub fn fake_c() -> Arc<Package> {
        static C: OnceLock<Arc<Package>> = OnceLock::new();
        C.get_or_init(|| {
            let mut p = Package::new("C", "C");
            p.mark_complete();
            Arc::new(p)
        })
        .clone()
    }
}

/// A parsed file handed to the type checker.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub parsed: Arc<ParsedFile>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckConfig {
    pub fake_import_c: bool,
    pub ignore_func_bodies: bool,
    pub disable_unused_import_check: bool,
}

/// An error reported through the checker's error sink. Soft errors (such as
/// unused imports) do not fail the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub path: PathBuf,
    pub row: usize,
    pub col: usize,
    pub message: String,
    pub soft: bool,
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.path.display(),
            self.row + 1,
            self.col + 1,
            self.message
        )
    }
}

/// Import capability handed to a type checker.
pub trait PackageImporter: Send + Sync {
    fn import_from(&self, import_path: &str, src_dir: &Path, mode: u32) -> Result<Arc<Package>>;
}

pub struct CheckRequest<'a> {
    pub import_path: &'a str,
    pub dir: &'a Path,
    pub files: &'a [SourceFile],
    /// Dependencies already imported, by import path.
    pub imports: &'a HashMap<String, Arc<Package>>,
    pub importer: &'a dyn PackageImporter,
    pub config: CheckConfig,
}

/// Turns parsed files into a [`Package`].
///
/// Problems are reported through `errors`; the importer keeps the first hard
/// one as the package's error even when `check` itself succeeds.
pub trait TypeChecker: Send + Sync {
    fn check(&self, req: &CheckRequest<'_>, errors: &mut dyn FnMut(TypeError)) -> Result<Package>;
}

/// Checks what can be known without a full type system: package clauses,
/// syntax, top-level redeclarations, imports and unused imports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowChecker;

impl TypeChecker for ShallowChecker {
    fn check(&self, req: &CheckRequest<'_>, errors: &mut dyn FnMut(TypeError)) -> Result<Package> {
        let mut pkg = Package::new(req.import_path, "");
        let hard = |path: &Path, row: usize, col: usize, message: String| TypeError {
            path: path.to_path_buf(),
            row,
            col,
            message,
            soft: false,
        };
        let mut declared: HashMap<&str, &Path> = HashMap::new();

        for sf in req.files {
            let pf = &sf.parsed;
            pkg.files.push(sf.path.clone());
            if pf.stub {
                continue;
            }
            if let Some(e) = &pf.error {
                errors(hard(&sf.path, e.row, e.col, e.message.clone()));
            }
            if pkg.name.is_empty() {
                pkg.name = pf.package.clone();
            } else if pf.package != pkg.name {
                errors(hard(
                    &sf.path,
                    0,
                    0,
                    format!("package {}; expected {}", pf.package, pkg.name),
                ));
            }
            for d in &pf.decls {
                if let Some(prev) = declared.insert(d.name.as_str(), sf.path.as_path()) {
                    errors(hard(
                        &sf.path,
                        d.row,
                        d.col,
                        format!(
                            "{} redeclared in this block (other declaration in {})",
                            d.name,
                            prev.display()
                        ),
                    ));
                }
                pkg.scope.insert(d.name.clone());
            }

            for spec in &pf.imports {
                if spec.path == "C" && req.config.fake_import_c {
                    continue;
                }
                let dep = match req.imports.get(&spec.path) {
                    Some(dep) => dep.clone(),
                    None => match req.importer.import_from(&spec.path, req.dir, 0) {
                        Ok(dep) => dep,
                        Err(err) => {
                            errors(hard(
                                &sf.path,
                                spec.row,
                                spec.col,
                                format!("could not import {} ({err})", spec.path),
                            ));
                            continue;
                        }
                    },
                };
                let local = spec.name.clone().unwrap_or_else(|| dep.name.clone());
                let check_unused = !req.config.disable_unused_import_check
                    && !req.config.ignore_func_bodies
                    && local != "_"
                    && local != ".";
                if check_unused && !pf.uses.contains(&local) {
                    errors(TypeError {
                        soft: true,
                        ..hard(
                            &sf.path,
                            spec.row,
                            spec.col,
                            format!("{:?} imported and not used", spec.path),
                        )
                    });
                }
                if !pkg.imports.iter().any(|p| p.path == dep.path) {
                    pkg.imports.push(dep);
                }
            }
        }
        pkg.mark_complete();
        Ok(pkg)
    }
}

/// Reads a package from compiled export data.
pub trait ExportDataReader: Send + Sync {
    fn read(
        &self,
        import_path: &str,
        archive: &Path,
        imports: &HashMap<String, Arc<Package>>,
    ) -> Result<Package>;
}

/// Accepts `ar` archives carrying a `__.PKGDEF` member.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveReader;

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_LEN: usize = 60;

impl ArchiveReader {
    fn has_pkgdef(r: &mut (impl Read + Seek)) -> std::io::Result<bool> {
        let mut hdr = [0u8; AR_HEADER_LEN];
        loop {
            match r.read_exact(&mut hdr) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            }
            let name = String::from_utf8_lossy(&hdr[..16]);
            if name.trim_end().trim_end_matches('/') == "__.PKGDEF" {
                return Ok(true);
            }
            let size: i64 = String::from_utf8_lossy(&hdr[48..58])
                .trim()
                .parse()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad member size"))?;
            // Members are padded to an even length.
            r.seek(SeekFrom::Current(size + (size & 1)))?;
        }
    }
}

impl ExportDataReader for ArchiveReader {
    fn read(
        &self,
        import_path: &str,
        archive: &Path,
        imports: &HashMap<String, Arc<Package>>,
    ) -> Result<Package> {
        let f = File::open(archive)
            .map_err(|e| ImportError::Cgo(format!("cannot open {import_path}.a: {e}")))?;
        let mut r = BufReader::new(f);
        let mut magic = [0u8; 8];
        if r.read_exact(&mut magic).is_err() || magic != AR_MAGIC {
            return Err(ImportError::Cgo(format!(
                "cannot create export data reader for {import_path} from {}: not an archive",
                archive.display()
            )));
        }
        match Self::has_pkgdef(&mut r) {
            Ok(true) => {}
            Ok(false) => {
                return Err(ImportError::Cgo(format!(
                    "cannot read export data for {import_path} from {}: no __.PKGDEF member",
                    archive.display()
                )))
            }
            Err(e) => {
                return Err(ImportError::Cgo(format!(
                    "cannot read export data for {import_path} from {}: {e}",
                    archive.display()
                )))
            }
        }
        let name = import_path.rsplit('/').next().unwrap_or(import_path);
        let mut pkg = Package::new(import_path, name);
        pkg.imports = imports.values().cloned().collect();
        pkg.imports.sort_by(|a, b| a.path.cmp(&b.path));
        pkg.mark_complete();
        Ok(pkg)
    }
}
