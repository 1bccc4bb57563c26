use loupe_goimport::{
    BuildContext, CheckRequest, Config, ImportError, Importer, Package, ShallowChecker,
    TypeChecker, TypeError,
};
use loupe_store::EnvMap;
use loupe_vfs::Vfs;
use pretty_assertions::assert_eq;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

/// Wraps the shallow checker, counting calls.
#[derive(Default)]
struct CountingChecker {
    calls: AtomicUsize,
}

impl CountingChecker {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TypeChecker for CountingChecker {
    fn check(
        &self,
        req: &CheckRequest<'_>,
        errors: &mut dyn FnMut(TypeError),
    ) -> loupe_goimport::Result<Package> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        ShallowChecker.check(req, errors)
    }
}

fn write(path: &Path, src: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, src).unwrap();
}

fn env(root: &Path) -> EnvMap {
    EnvMap::new()
        .add("GOROOT", root.join("goroot").to_string_lossy())
        .add("GOPATH", root.join("gopath").to_string_lossy())
        .add("CGO_ENABLED", "0")
}

/// A module with `app` importing `lib`.
fn module(root: &Path) -> PathBuf {
    let m = root.join("m");
    write(&m.join("go.mod"), "module example.com/m\n\ngo 1.21\n");
    write(&m.join("lib/lib.go"), "package lib\n\nfunc L() int { return 1 }\n");
    write(
        &m.join("app/app.go"),
        "package app\n\nimport \"example.com/m/lib\"\n\nvar A = lib.L()\n",
    );
    m
}

#[test]
fn concurrent_imports_check_once() {
    let dir = tempdir().unwrap();
    let m = module(dir.path());
    let checker = Arc::new(CountingChecker::default());
    let kp = Importer::new(BuildContext::from_env(&env(dir.path())), Vfs::new(), Config::default())
        .with_checker(checker.clone());

    let app = m.join("app");
    std::thread::scope(|s| {
        for _ in 0..4 {
            let kp = kp.clone();
            let app = app.clone();
            s.spawn(move || {
                let pkg = kp.import_from("example.com/m/lib", &app, 0).unwrap();
                assert_eq!(pkg.name, "lib");
                assert!(pkg.complete);
            });
        }
    });
    assert_eq!(checker.calls(), 1);

    let pkg = kp.import_from("example.com/m/app", &app, 0).unwrap();
    assert_eq!(pkg.imports.len(), 1);
    assert_eq!(pkg.imports[0].path, "example.com/m/lib");
    assert_eq!(checker.calls(), 2);
}

#[test]
fn separate_importers_share_the_vfs_cache() {
    let dir = tempdir().unwrap();
    let m = module(dir.path());
    let vfs = Vfs::new();
    let checker = Arc::new(CountingChecker::default());
    let bld = BuildContext::from_env(&env(dir.path()));

    for _ in 0..2 {
        Importer::new(bld.clone(), vfs.clone(), Config::default())
            .with_checker(checker.clone())
            .import_from(".", &m.join("app"), 0)
            .unwrap();
    }
    assert_eq!(checker.calls(), 2);

    // Different strictness is a different package state.
    Importer::new(
        bld,
        vfs,
        Config {
            check_funcs: true,
            ..Default::default()
        },
    )
    .with_checker(checker.clone())
    .import_from(".", &m.join("app"), 0)
    .unwrap();
    assert_eq!(checker.calls(), 3);
}

#[test]
fn changed_dependency_invalidates_its_importers() {
    let dir = tempdir().unwrap();
    let m = module(dir.path());
    let vfs = Vfs::with_expiry(|_| None);
    let checker = Arc::new(CountingChecker::default());
    let kp = Importer::new(BuildContext::from_env(&env(dir.path())), vfs.clone(), Config::default())
        .with_checker(checker.clone());

    kp.import_from(".", &m.join("app"), 0).unwrap();
    kp.import_from(".", &m.join("app"), 0).unwrap();
    assert_eq!(checker.calls(), 2);

    let lib = m.join("lib/lib.go");
    fs::write(&lib, "package lib\n\nfunc L() int { return 2 }\n").unwrap();
    File::options()
        .write(true)
        .open(&lib)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    let nd = vfs.poke(&lib);
    nd.invalidate();
    nd.stat().unwrap();

    kp.import_from(".", &m.join("app"), 0).unwrap();
    assert_eq!(checker.calls(), 4);
}

#[test]
fn import_cycle_is_reported_without_deadlock() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("gopath/src");
    write(&src.join("a/a.go"), "package a\n\nimport \"b\"\n\nvar A = b.B\n");
    write(&src.join("b/b.go"), "package b\n\nimport \"a\"\n\nvar B = a.A\n");
    let env = env(dir.path()).add("GO111MODULE", "off");
    let kp = Importer::new(BuildContext::from_env(&env), Vfs::new(), Config::default());

    let (tx, rx) = mpsc::channel();
    let from = src.join("a");
    std::thread::spawn(move || {
        let _ = tx.send(kp.import_from("a", &from, 0));
    });
    let err = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("import finished")
        .unwrap_err();
    assert!(err.is_cycle(), "{err}");
    let msg = err.to_string();
    assert!(msg.contains("import cycle"), "{msg}");
    assert!(msg.contains(&format!("a({})", src.join("a").display())), "{msg}");
    assert!(msg.contains(&format!("b({})", src.join("b").display())), "{msg}");
}

#[test]
fn sibling_cycle_across_workers_is_reported() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("gopath/src");
    write(
        &src.join("top/top.go"),
        "package top\n\nimport (\n\t\"x\"\n\t\"y\"\n)\n\nvar T = x.X + y.Y\n",
    );
    write(&src.join("x/x.go"), "package x\n\nimport \"y\"\n\nvar X = y.Y\n");
    write(&src.join("y/y.go"), "package y\n\nimport \"x\"\n\nvar Y = x.X\n");
    let env = env(dir.path()).add("GO111MODULE", "off");
    let kp = Importer::new(
        BuildContext::from_env(&env),
        Vfs::new(),
        Config {
            concurrency: 2,
            ..Default::default()
        },
    );

    let (tx, rx) = mpsc::channel();
    let from = src.join("top");
    std::thread::spawn(move || {
        let _ = tx.send(kp.import_from("top", &from, 0));
    });
    let err = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("import finished")
        .unwrap_err();
    assert!(err.is_cycle(), "{err}");
}

#[test]
fn cycle_split_below_the_sibling_holding_it_is_reported() {
    // top imports x and y; x -> z -> y and y -> w -> x, so each worker holds
    // one end of the cycle deeper than the state the other one wants.
    for round in 0..20 {
        let dir = tempdir().unwrap();
        let src = dir.path().join("gopath/src");
        write(
            &src.join("top/top.go"),
            r#"package top

import (
	"x"
	"y"
)

var T = x.X + y.Y
"#,
        );
        write(&src.join("x/x.go"), r#"package x

import "z"

var X = z.Z
"#);
        write(&src.join("z/z.go"), r#"package z

import "y"

var Z = y.Y
"#);
        write(&src.join("y/y.go"), r#"package y

import "w"

var Y = w.W
"#);
        write(&src.join("w/w.go"), r#"package w

import "x"

var W = x.X
"#);
        let env = env(dir.path()).add("GO111MODULE", "off");
        let kp = Importer::new(
            BuildContext::from_env(&env),
            Vfs::new(),
            Config {
                concurrency: 2,
                ..Default::default()
            },
        );

        let (tx, rx) = mpsc::channel();
        let from = src.join("top");
        std::thread::spawn(move || {
            let _ = tx.send(kp.import_from("top", &from, 0));
        });
        let res = rx
            .recv_timeout(Duration::from_secs(10))
            .unwrap_or_else(|_| panic!("round {round}: import hung"));
        let err = res.unwrap_err();
        assert!(err.is_cycle(), "round {round}: {err}");
    }
}

#[test]
fn syscall_js_is_imported_for_js_wasm() {
    let dir = tempdir().unwrap();
    let js = dir.path().join("goroot/src/syscall/js");
    write(&js.join("js.go"), "package js\n\nvar Base = 1\n");
    write(&js.join("value_js.go"), "package js\n\nvar OnJS = 1\n");
    write(
        &js.join("wasm.go"),
        "//go:build js && wasm\n\npackage js\n\nvar OnWasm = 1\n",
    );
    let app = dir.path().join("gopath/src/app");
    write(
        &app.join("app.go"),
        "package app\n\nimport \"syscall/js\"\n\nvar A = js.Base\n",
    );
    let env = env(dir.path())
        .add("GO111MODULE", "off")
        .add("GOOS", "linux")
        .add("GOARCH", "amd64");
    let kp = Importer::new(BuildContext::from_env(&env), Vfs::new(), Config::default());

    let pkg = kp.import_from("app", &app, 0).unwrap();
    let js_pkg = pkg
        .imports
        .iter()
        .find(|p| p.path == "syscall/js")
        .expect("syscall/js imported");
    assert!(js_pkg.scope.contains("OnJS"), "{:?}", js_pkg.scope);
    assert!(js_pkg.scope.contains("OnWasm"), "{:?}", js_pkg.scope);

    let direct = kp.import_from("syscall/js", &app, 0).unwrap();
    assert!(direct.scope.contains("OnWasm"));
    assert_eq!(kp.build_context().goos, "linux");
}

/// Hands back packages the way a checker that gave up half way would.
#[derive(Default)]
struct IncompleteChecker {
    calls: AtomicUsize,
}

impl TypeChecker for IncompleteChecker {
    fn check(
        &self,
        req: &CheckRequest<'_>,
        _errors: &mut dyn FnMut(TypeError),
    ) -> loupe_goimport::Result<Package> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Package::new(req.import_path, "lib"))
    }
}

#[test]
fn incomplete_packages_are_reported_as_partial() {
    let dir = tempdir().unwrap();
    let m = module(dir.path());
    let checker = Arc::new(IncompleteChecker::default());
    let kp = Importer::new(BuildContext::from_env(&env(dir.path())), Vfs::new(), Config::default())
        .with_checker(checker.clone());

    for _ in 0..2 {
        let err = kp.import_from("example.com/m/lib", &m, 0).unwrap_err();
        assert!(
            matches!(&err, ImportError::Partial(p) if p == "example.com/m/lib"),
            "{err}"
        );
    }
    assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    assert!(err_is_partial_dep(&kp.import_from("example.com/m/app", &m, 0).unwrap_err()));
}

fn err_is_partial_dep(err: &ImportError) -> bool {
    match err {
        ImportError::Import { source, .. } => matches!(**source, ImportError::Partial(_)),
        _ => false,
    }
}

#[test]
fn builtin_packages_do_not_touch_the_disk() {
    let vfs = Vfs::new();
    let kp = Importer::new(BuildContext::from_env(&EnvMap::new()), vfs.clone(), Config::default());

    let pkg = kp.import_from("unsafe", Path::new("/tmp"), 0).unwrap();
    assert_eq!(pkg.name, "unsafe");
    assert!(pkg.complete);
    assert!(pkg.scope.contains("Pointer"));

    let pkg = kp.import_from("C", Path::new("/tmp"), 0).unwrap();
    assert_eq!(pkg.name, "C");
    assert!(pkg.complete);

    assert!(vfs.root().children().is_empty());
}

#[test]
fn only_mode_zero_is_supported() {
    let kp = Importer::new(BuildContext::from_env(&EnvMap::new()), Vfs::new(), Config::default());
    let err = kp.import_from("fmt", Path::new("/tmp"), 1).unwrap_err();
    assert!(matches!(err, ImportError::Mode(1)));
}

#[test]
fn broken_dependency_is_reported_at_the_import() {
    let dir = tempdir().unwrap();
    let m = module(dir.path());
    write(&m.join("lib/lib.go"), "package lib\n\nvar = 1\n");
    let kp = Importer::new(BuildContext::from_env(&env(dir.path())), Vfs::new(), Config::default());

    let err = kp.import_from(".", &m.join("app"), 0).unwrap_err();
    let issue = err.issue().expect("positioned error");
    assert_eq!(issue.path, m.join("app/app.go").display().to_string());
    assert_eq!((issue.row, issue.col), (2, 7));
    assert!(
        issue.message.contains(&m.join("lib/lib.go").display().to_string()),
        "{}",
        issue.message
    );
}

#[test]
fn first_hard_type_error_fails_the_package() {
    let dir = tempdir().unwrap();
    let m = module(dir.path());
    write(&m.join("lib/dup.go"), "package lib\n\nvar L = 2\n");
    let kp = Importer::new(BuildContext::from_env(&env(dir.path())), Vfs::new(), Config::default());

    let err = kp
        .import_from("example.com/m/lib", &m, 0)
        .unwrap_err();
    let issue = err.issue().expect("positioned error");
    assert!(issue.message.starts_with("L redeclared"), "{}", issue.message);

    // Soft errors, like an unused import, do not.
    write(&m.join("lib/dup.go"), "package lib\n\nimport \"example.com/m/util\"\n");
    write(&m.join("util/util.go"), "package util\n");
    let kp = Importer::new(
        BuildContext::from_env(&env(dir.path())),
        Vfs::new(),
        Config {
            check_imports: true,
            ..Default::default()
        },
    );
    let pkg = kp.import_from("example.com/m/lib", &m, 0).unwrap();
    assert!(pkg.complete);
}

#[test]
fn missing_package_names_the_search_paths() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("gopath/src/app");
    write(&src.join("app.go"), "package app\n\nimport \"nope/x\"\n");
    let env = env(dir.path()).add("GO111MODULE", "off");
    let kp = Importer::new(BuildContext::from_env(&env), Vfs::new(), Config::default());

    let err = kp.import_from(".", &src, 0).unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("cannot find package \"nope/x\" in any of:"), "{msg}");
    assert!(msg.contains("(from $GOROOT)") && msg.contains("(from $GOPATH)"), "{msg}");
}
