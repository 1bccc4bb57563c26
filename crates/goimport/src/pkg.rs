use loupe_vfs::Vfs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use crate::build::{clean_path, BuildContext};
use crate::error::{ImportError, Result};
use crate::modfile::parse_go_mod;
use crate::parse::{parse_file, ParseMode};

/// A package directory found by the resolver but not yet imported.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PkgPath {
    pub dir: PathBuf,
    pub import_path: String,
    pub goroot: bool,
    /// Path of the module that provides the package, in module mode.
    pub module: Option<String>,
}

/// A finalised package record, as used for import suggestions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pkg {
    /// Directory prefix (with trailing separator) a package must live under
    /// to import this one. Empty when anyone may import it.
    pub importable_pfx: String,
    pub dir: PathBuf,
    pub name: String,
    pub import_path: String,
    pub goroot: bool,
}

impl Pkg {
    pub fn is_command(&self) -> bool {
        self.name == "main"
    }

    /// Reports whether code in `src_dir` may import this package.
    pub fn importable(&self, src_dir: &Path) -> bool {
        if self.import_path == "." || self.is_command() {
            return false;
        }
        let src = src_dir.to_string_lossy();
        let pfx = self.importable_pfx.as_str();
        if !pfx.is_empty() {
            return src.starts_with(pfx) || src == pfx[..pfx.len() - 1];
        }
        self.dir != src_dir
    }

    /// Cleans `dir`, computes the visibility prefix and strips vendor
    /// segments from the import path.
    pub fn finalize(&mut self) {
        self.dir = clean_path(&self.dir);
        let dir = self.dir.to_string_lossy().into_owned();
        self.importable_pfx = segment_parent(&dir, "internal")
            .or_else(|| segment_parent(&dir, "vendor"))
            .unwrap_or_default();

        let s = &self.import_path;
        if let Some(i) = s.rfind("/vendor/") {
            self.import_path = s[i + "/vendor/".len()..].to_string();
        } else if let Some(rest) = s.strip_prefix("vendor/") {
            self.import_path = rest.to_string();
        }
    }
}

/// The parent of the last `seg` path segment in `dir`, plus a separator.
fn segment_parent(dir: &str, seg: &str) -> Option<String> {
    let mid = format!("{MAIN_SEPARATOR}{seg}{MAIN_SEPARATOR}");
    let tail = format!("{MAIN_SEPARATOR}{seg}");
    let end = match dir.rfind(&mid) {
        Some(i) => i,
        None if dir.ends_with(&tail) => dir.len() - tail.len(),
        None => return None,
    };
    let parent = &dir[..end];
    Some(format!("{parent}{MAIN_SEPARATOR}"))
}

/// Names that may hold package sources: `.go` files that are neither tests
/// nor hidden.
pub fn is_pkg_file_name(name: &str) -> bool {
    !name.starts_with('.')
        && !name.starts_with('_')
        && name.ends_with(".go")
        && !name.ends_with("_test.go")
}

/// Reports whether the directory lists at least one package source file.
pub fn has_go_files(vfs: &Vfs, dir: &Path) -> bool {
    vfs.read_dir(dir)
        .map(|ls| ls.iter().any(|nd| is_pkg_file_name(nd.name())))
        .unwrap_or(false)
}

fn slash_rel(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

/// The import path of `dir`, derived from GOROOT, GOPATH or the enclosing
/// module. Returns `(".", false)` when none applies.
pub fn import_path_for_dir(bld: &BuildContext, vfs: &Vfs, dir: &Path) -> (String, bool) {
    if let Some(rel) = slash_rel(dir, &bld.goroot_src()) {
        return (rel, true);
    }
    for gp in &bld.gopath {
        if let Some(rel) = slash_rel(dir, &gp.join("src")) {
            if !rel.is_empty() {
                return (rel, false);
            }
        }
    }
    if let Some(gomod) = bld.mod_file(vfs, dir) {
        let module = gomod
            .blob()
            .ok()
            .and_then(|src| parse_go_mod(&String::from_utf8_lossy(&src)).ok())
            .map(|mf| mf.module);
        let root = gomod.parent().map(|p| p.path());
        if let (Some(module), Some(root)) = (module, root) {
            if let Some(rel) = slash_rel(dir, &root) {
                let ip = if rel.is_empty() {
                    module
                } else {
                    format!("{module}/{rel}")
                };
                return (ip, false);
            }
        }
    }
    (".".to_string(), false)
}

/// Reads the package clause of the first buildable file in `dir`.
///
/// The result is memoised in the directory's node until it changes.
pub fn import_dir(bld: &BuildContext, vfs: &Vfs, dir: &Path) -> Result<Pkg> {
    #[derive(Clone, PartialEq)]
    struct ImportDirKey {
        goroot: PathBuf,
        gopath: String,
    }

    let dir = clean_path(dir);
    let nd = vfs.poke(&dir);
    let key = ImportDirKey {
        goroot: bld.goroot.clone(),
        gopath: bld.gopath_str(),
    };
    let res: Arc<Result<Pkg>> = nd.memo().read(key, || read_pkg(bld, vfs, &dir));
    (*res).clone()
}

fn read_pkg(bld: &BuildContext, vfs: &Vfs, dir: &Path) -> Result<Pkg> {
    let ls = vfs.read_dir(dir)?;
    let mut names: Vec<String> = ls
        .iter()
        .map(|nd| nd.name().to_string())
        .filter(|nm| is_pkg_file_name(nm) && bld.match_file_name(nm))
        .collect();
    names.sort();

    let mut err = ImportError::NoGo(dir.to_path_buf());
    for nm in names {
        let src = match vfs.blob(dir.join(&nm)) {
            Ok(src) => src,
            Err(e) => {
                err = e.into();
                continue;
            }
        };
        if !bld.match_constraints(&src) {
            continue;
        }
        let pf = parse_file(None, &src, ParseMode::SkipFuncBodies);
        if pf.package.is_empty() {
            continue;
        }
        let (import_path, goroot) = import_path_for_dir(bld, vfs, dir);
        let mut p = Pkg {
            dir: dir.to_path_buf(),
            name: pf.package.clone(),
            import_path,
            goroot,
            ..Default::default()
        };
        p.finalize();
        return Ok(p);
    }
    Err(err)
}
