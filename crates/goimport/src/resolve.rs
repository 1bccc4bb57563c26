use loupe_vfs::Vfs;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use crate::build::{clean_path, BuildContext, SrcDirKey};
use crate::error::{ImportError, Result};
use crate::modfile::{encode_path, parse_go_mod, parse_go_sum, semver_is_valid};
use crate::pkg::{has_go_files, PkgPath};

/// Resolves `import_path` as seen from `src_dir` to a package directory.
///
/// Lookups go through the VFS and are memoised in the node of the directory
/// that owns the answer: the `go.mod` directory in module mode, `src_dir`
/// otherwise.
pub fn find_pkg(bld: &BuildContext, vfs: &Vfs, import_path: &str, src_dir: &Path) -> Result<PkgPath> {
    if is_local_import(import_path) {
        return find_local(vfs, import_path, src_dir);
    }

    let gr_dir = bld.goroot_src().join(import_path);
    if has_go_files(vfs, &gr_dir) {
        return Ok(PkgPath {
            dir: gr_dir,
            import_path: import_path.to_string(),
            goroot: true,
            module: None,
        });
    }
    if bld.mod_enabled(vfs, src_dir) {
        return find_in_module(bld, vfs, import_path, src_dir);
    }
    if let Some(p) = find_in_mod_cache(vfs, import_path, src_dir) {
        return Ok(p);
    }
    find_in_gopath(bld, vfs, import_path, src_dir)
}

pub fn is_local_import(ip: &str) -> bool {
    ip == "." || ip == ".." || ip.starts_with("./") || ip.starts_with("../")
}

fn find_local(vfs: &Vfs, import_path: &str, src_dir: &Path) -> Result<PkgPath> {
    let dir = clean_path(&src_dir.join(import_path));
    if !has_go_files(vfs, &dir) {
        return Err(ImportError::not_found(format!(
            "cannot find package `{import_path}` in `{}`",
            dir.display()
        )));
    }
    // Local packages have no import path of their own; key them by directory.
    let ip = format!("_{}", dir.to_string_lossy().replace(MAIN_SEPARATOR, "/"));
    Ok(PkgPath {
        dir,
        import_path: ip,
        goroot: false,
        module: None,
    })
}

#[derive(Clone, PartialEq)]
struct FindKey {
    src_dir: SrcDirKey,
    import_path: String,
}

fn find_in_module(bld: &BuildContext, vfs: &Vfs, import_path: &str, src_dir: &Path) -> Result<PkgPath> {
    let gomod = bld.mod_file(vfs, src_dir).ok_or_else(|| {
        ImportError::not_found(format!("cannot find go.mod for `{}`", src_dir.display()))
    })?;
    let Some(mod_nd) = gomod.parent() else {
        return Err(ImportError::not_found("go.mod has no parent directory"));
    };
    let key = FindKey {
        src_dir: bld.src_dir_key(src_dir),
        import_path: import_path.to_string(),
    };
    let res: Arc<Result<PkgPath>> = mod_nd.memo().read(key, || {
        let ms = ModSum::load(vfs, &mod_nd.path())?;
        ms.find(bld, vfs, import_path)
    });
    (*res).clone()
}

/// A package inside the module cache resolves its siblings from the same
/// module version.
fn find_in_mod_cache(vfs: &Vfs, import_path: &str, src_dir: &Path) -> Option<PkgPath> {
    let src = clean_path(src_dir).to_string_lossy().into_owned();
    let pkg_mod = format!("{MAIN_SEPARATOR}pkg{MAIN_SEPARATOR}mod{MAIN_SEPARATOR}");
    let pm_pos = src.find(&pkg_mod)?;
    let v_pos = pm_pos + src[pm_pos..].find("@v")?;
    let mod_dir = match src[v_pos..].find(MAIN_SEPARATOR) {
        Some(i) => &src[..v_pos + i],
        None => &src[..],
    };
    let module = mod_dir[pm_pos + pkg_mod.len()..v_pos].replace(MAIN_SEPARATOR, "/");
    let sfx = import_path.strip_prefix(module.as_str())?;
    if !sfx.is_empty() && !sfx.starts_with('/') {
        return None;
    }
    if !semver_is_valid(&mod_dir[v_pos + 1..]) {
        return None;
    }
    let dir = Path::new(mod_dir).join(sfx.trim_start_matches('/'));
    if !has_go_files(vfs, &dir) {
        return None;
    }
    Some(PkgPath {
        dir: clean_path(&dir),
        import_path: import_path.to_string(),
        goroot: false,
        module: Some(module),
    })
}

/// GOPATH mode: vendor directories up to the GOPATH root, then GOROOT, then
/// every GOPATH entry. Only the directory's existence is checked.
fn find_in_gopath(bld: &BuildContext, vfs: &Vfs, import_path: &str, src_dir: &Path) -> Result<PkgPath> {
    let key = FindKey {
        src_dir: bld.src_dir_key(src_dir),
        import_path: import_path.to_string(),
    };
    let nd = vfs.poke(&key.src_dir.src_dir);
    let src_dir = key.src_dir.src_dir.clone();
    let res: Arc<Result<PkgPath>> = nd.memo().read(key, || {
        let roots: Vec<PathBuf> = std::iter::once(bld.goroot_src())
            .chain(bld.gopath.iter().map(|gp| gp.join("src")))
            .collect();
        if let Some(root) = roots.iter().find(|r| src_dir.starts_with(r)) {
            let mut dir = Some(src_dir.as_path());
            while let Some(d) = dir {
                if !d.starts_with(root) {
                    break;
                }
                let cand = d.join("vendor").join(import_path);
                if vfs.is_dir(&cand) {
                    let ip = cand
                        .strip_prefix(root)
                        .map(|rel| rel.to_string_lossy().replace(MAIN_SEPARATOR, "/"))
                        .unwrap_or_else(|_| import_path.to_string());
                    return Ok(PkgPath {
                        dir: cand,
                        import_path: ip,
                        goroot: false,
                        module: None,
                    });
                }
                dir = d.parent();
            }
        }
        for (i, root) in roots.iter().enumerate() {
            let cand = root.join(import_path);
            if vfs.is_dir(&cand) {
                return Ok(PkgPath {
                    dir: cand,
                    import_path: import_path.to_string(),
                    goroot: i == 0,
                    module: None,
                });
            }
        }
        let tried: Vec<String> = roots
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let from = if i == 0 { "$GOROOT" } else { "$GOPATH" };
                format!("\t{} (from {from})", r.join(import_path).display())
            })
            .collect();
        Err(ImportError::not_found(format!(
            "cannot find package {import_path:?} in any of:\n{}",
            tried.join("\n")
        )))
    });
    (*res).clone()
}

#[derive(Debug, Clone)]
struct ModDep {
    /// Set for the main module and local replacements.
    dir: Option<PathBuf>,
    mod_path: String,
    version: String,
}

/// `go.mod` plus `go.sum` of one module, flattened into requirements.
#[derive(Debug)]
struct ModSum {
    dir: PathBuf,
    gomod: PathBuf,
    module: String,
    deps: HashMap<String, ModDep>,
}

impl ModSum {
    fn load(vfs: &Vfs, dir: &Path) -> Result<Self> {
        let gomod = dir.join("go.mod");
        let src = vfs.blob(&gomod)?;
        let mf = parse_go_mod(&String::from_utf8_lossy(&src))?;
        let mut deps = HashMap::new();

        for r in &mf.require {
            deps.insert(
                r.path.clone(),
                ModDep {
                    dir: None,
                    mod_path: r.path.clone(),
                    version: r.version.clone(),
                },
            );
        }

        for r in &mf.replace {
            let mut md = ModDep {
                dir: None,
                mod_path: r.new_path.clone(),
                version: r.new_version.clone().unwrap_or_default(),
            };
            if r.is_local() {
                let target = clean_path(&dir.join(&r.new_path));
                // A local replacement only counts when it is itself a module.
                if vfs.is_file(target.join("go.mod")) {
                    md.dir = Some(target);
                    md.mod_path = r.old_path.clone();
                }
            }
            deps.insert(r.old_path.clone(), md);
        }

        deps.insert(
            mf.module.clone(),
            ModDep {
                dir: Some(dir.to_path_buf()),
                mod_path: mf.module.clone(),
                version: String::new(),
            },
        );

        if let Ok(sum) = vfs.blob(dir.join("go.sum")) {
            for r in parse_go_sum(&String::from_utf8_lossy(&sum)) {
                deps.entry(r.path.clone()).or_insert(ModDep {
                    dir: None,
                    mod_path: r.path,
                    version: r.version,
                });
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            gomod,
            module: mf.module,
            deps,
        })
    }

    /// The requirement covering `import_path`, the path it matched under and
    /// the remaining sub-package path.
    fn require(&self, import_path: &str) -> Result<(&ModDep, String, String)> {
        let mut p = import_path;
        loop {
            if let Some(md) = self.deps.get(p) {
                let sub = import_path[p.len()..].trim_start_matches('/').to_string();
                return Ok((md, p.to_string(), sub));
            }
            match p.rsplit_once('/') {
                Some((parent, _)) => p = parent,
                None => break,
            }
        }
        Err(ImportError::not_found(format!(
            "require({import_path}) not found in {}",
            self.gomod.display()
        )))
    }

    fn find(&self, bld: &BuildContext, vfs: &Vfs, import_path: &str) -> Result<PkgPath> {
        let (md, matched, sub) = self.require(import_path)?;
        let ls_pkg = |pfx: &Path, sfx: &str| {
            let dir = clean_path(&pfx.join(sfx));
            has_go_files(vfs, &dir).then(|| PkgPath {
                dir,
                import_path: import_path.to_string(),
                goroot: false,
                module: Some(matched.clone()),
            })
        };

        if matched == self.module && sub.is_empty() {
            return Err(ImportError::not_found(format!(
                "cannot import main module `{import_path}`"
            )));
        }
        if let Some(dir) = &md.dir {
            return ls_pkg(dir, &sub).ok_or_else(|| {
                ImportError::not_found(format!(
                    "cannot find local/replacement package `{import_path}` in `{}`",
                    dir.display()
                ))
            });
        }

        let gr_src = bld.goroot_src();
        let mut roots: HashSet<PathBuf> = HashSet::from([gr_src.clone()]);
        roots.extend(bld.gopath.iter().map(|gp| gp.join("src")));

        let local_vendor = || ls_pkg(&self.dir.join("vendor"), import_path);
        let pkg_mod = || {
            let rel = format!("pkg/mod/{}@{}", encode_path(&md.mod_path), md.version);
            bld.gopath
                .iter()
                .find_map(|gp| ls_pkg(&gp.join(&rel), &sub))
        };
        let other_vendors = || {
            let mut dir = self.dir.parent();
            while let Some(d) = dir {
                if roots.contains(d) || d.parent().is_none() {
                    break;
                }
                if let Some(p) = ls_pkg(&d.join("vendor"), import_path) {
                    return Some(p);
                }
                dir = d.parent();
            }
            None
        };
        let goroot_vendor = || ls_pkg(&gr_src.join("vendor"), import_path);

        let first = import_path.split('/').next().unwrap_or("");
        let found = if first.contains('.') {
            local_vendor()
                .or_else(pkg_mod)
                .or_else(other_vendors)
                .or_else(goroot_vendor)
        } else {
            // Paths without a dot in the first element are reserved for the
            // standard library.
            goroot_vendor()
                .or_else(local_vendor)
                .or_else(pkg_mod)
                .or_else(other_vendors)
        };
        found.ok_or_else(|| {
            ImportError::not_found(format!(
                "cannot find `{import_path}` using `{}`",
                self.gomod.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_store::EnvMap;
    use pretty_assertions::assert_eq;
    use std::fs;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        bld: BuildContext,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        fs::create_dir_all(root.join("goroot/src/fmt")).unwrap();
        fs::write(root.join("goroot/src/fmt/print.go"), "package fmt\n").unwrap();
        fs::create_dir_all(root.join("gopath")).unwrap();
        let env = EnvMap::new()
            .add("GOROOT", root.join("goroot").to_string_lossy())
            .add("GOPATH", root.join("gopath").to_string_lossy())
            .add("GO111MODULE", "");
        Fixture {
            bld: BuildContext::from_env(&env),
            _tmp: tmp,
            root,
        }
    }

    fn write(path: PathBuf, src: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, src).unwrap();
    }

    #[test]
    fn stdlib_comes_first() {
        let fx = fixture();
        let p = find_pkg(&fx.bld, &Vfs::new(), "fmt", &fx.root).unwrap();
        assert!(p.goroot);
        assert_eq!(p.dir, fx.root.join("goroot/src/fmt"));
    }

    #[test]
    fn module_self_and_sub_packages() {
        let fx = fixture();
        let m = fx.root.join("m");
        write(m.join("go.mod"), "module example.com/m\n");
        write(m.join("lib/lib.go"), "package lib\n");
        write(m.join("main.go"), "package main\n");

        let vfs = Vfs::new();
        let p = find_pkg(&fx.bld, &vfs, "example.com/m/lib", &m).unwrap();
        assert_eq!(p.dir, m.join("lib"));
        assert_eq!(p.import_path, "example.com/m/lib");
        assert_eq!(p.module.as_deref(), Some("example.com/m"));

        let err = find_pkg(&fx.bld, &vfs, "example.com/m", &m.join("lib")).unwrap_err();
        assert!(err.to_string().contains("main module"), "{err}");

        let err = find_pkg(&fx.bld, &vfs, "example.com/other", &m).unwrap_err();
        assert!(err.to_string().starts_with("require(example.com/other)"), "{err}");
    }

    #[test]
    fn vendor_wins_over_the_module_cache() {
        let fx = fixture();
        let m = fx.root.join("m");
        write(
            m.join("go.mod"),
            "module example.com/m\n\nrequire github.com/Dep/x v1.0.0\n",
        );
        write(m.join("vendor/github.com/Dep/x/x.go"), "package x\n");
        write(
            fx.root.join("gopath/pkg/mod/github.com/!dep/x@v1.0.0/x.go"),
            "package x\n",
        );

        let p = find_pkg(&fx.bld, &Vfs::new(), "github.com/Dep/x", &m).unwrap();
        assert_eq!(p.dir, m.join("vendor/github.com/Dep/x"));
        assert_eq!(p.module.as_deref(), Some("github.com/Dep/x"));

        fs::remove_dir_all(m.join("vendor")).unwrap();
        let p = find_pkg(&fx.bld, &Vfs::new(), "github.com/Dep/x", &m).unwrap();
        assert_eq!(p.dir, fx.root.join("gopath/pkg/mod/github.com/!dep/x@v1.0.0"));
    }

    #[test]
    fn go_sum_supplements_requirements() {
        let fx = fixture();
        let m = fx.root.join("m");
        write(m.join("go.mod"), "module example.com/m\n");
        write(m.join("go.sum"), "rsc.io/quote v1.5.2 h1:abc=\n");
        write(
            fx.root.join("gopath/pkg/mod/rsc.io/quote@v1.5.2/sub/q.go"),
            "package sub\n",
        );
        let p = find_pkg(&fx.bld, &Vfs::new(), "rsc.io/quote/sub", &m).unwrap();
        assert_eq!(p.dir, fx.root.join("gopath/pkg/mod/rsc.io/quote@v1.5.2/sub"));
    }

    #[test]
    fn local_replacements_need_a_go_mod() {
        let fx = fixture();
        let m = fx.root.join("m");
        write(
            m.join("go.mod"),
            "module example.com/m\n\nrequire example.com/lib v0.1.0\nreplace example.com/lib => ../lib\n",
        );
        write(fx.root.join("lib/go.mod"), "module example.com/lib\n");
        write(fx.root.join("lib/util/u.go"), "package util\n");

        let p = find_pkg(&fx.bld, &Vfs::new(), "example.com/lib/util", &m).unwrap();
        assert_eq!(p.dir, fx.root.join("lib/util"));
        assert_eq!(p.module.as_deref(), Some("example.com/lib"));

        fs::remove_file(fx.root.join("lib/go.mod")).unwrap();
        let err = find_pkg(&fx.bld, &Vfs::new(), "example.com/lib/util", &m).unwrap_err();
        assert!(err.to_string().starts_with("cannot find `example.com/lib/util`"), "{err}");
    }

    #[test]
    fn local_imports_resolve_against_src_dir() {
        let fx = fixture();
        write(fx.root.join("w/a/a.go"), "package a\n");
        let p = find_pkg(&fx.bld, &Vfs::new(), "./a", &fx.root.join("w")).unwrap();
        assert_eq!(p.dir, fx.root.join("w/a"));
        assert!(p.import_path.starts_with('_'));
        assert!(find_pkg(&fx.bld, &Vfs::new(), "./missing", &fx.root.join("w")).is_err());
    }

    #[test]
    fn gopath_mode_searches_vendor_then_roots() {
        let fx = fixture();
        let app = fx.root.join("gopath/src/app");
        write(app.join("main.go"), "package main\n");
        write(app.join("vendor/dep/d.go"), "package dep\n");
        write(fx.root.join("gopath/src/other/o.go"), "package other\n");

        let vfs = Vfs::new();
        let p = find_pkg(&fx.bld, &vfs, "dep", &app).unwrap();
        assert_eq!(p.dir, app.join("vendor/dep"));
        assert_eq!(p.import_path, "app/vendor/dep");

        let p = find_pkg(&fx.bld, &vfs, "other", &app).unwrap();
        assert_eq!(p.dir, fx.root.join("gopath/src/other"));
        assert_eq!(p.module, None);

        let err = find_pkg(&fx.bld, &vfs, "nowhere", &app).unwrap_err();
        assert!(err.to_string().contains("cannot find package \"nowhere\""), "{err}");
    }

    #[test]
    fn module_cache_siblings() {
        let fx = fixture();
        let base = fx.root.join("gopath/pkg/mod/example.com/dep@v1.2.0");
        write(base.join("a/a.go"), "package a\n");
        write(base.join("b/b.go"), "package b\n");
        let p = find_pkg(&fx.bld, &Vfs::new(), "example.com/dep/b", &base.join("a")).unwrap();
        assert_eq!(p.dir, base.join("b"));
        assert_eq!(p.module.as_deref(), Some("example.com/dep"));
    }
}
