use loupe_vfs::{FileKind, Vfs};
use pretty_assertions::assert_eq;
use std::fs::{self, File};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

#[derive(Clone, PartialEq)]
struct Key(&'static str);

fn bump_mtime(path: &std::path::Path, secs: u64) {
    let f = File::options().write(true).open(path).expect("open");
    f.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .expect("set mtime");
}

#[test]
fn expired_stat_picks_up_new_mtime_and_clears_memo() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.go");
    fs::write(&path, "package main\n").unwrap();

    let vfs = Vfs::with_expiry(|now| Some(now));
    let nd = vfs.poke(&path);
    let before = nd.stat().expect("stat");
    nd.memo().put(Key("parsed"), 1u32);

    fs::write(&path, "package main\n\nfunc main() {}\n").unwrap();
    bump_mtime(&path, 30);

    let after = nd.stat().expect("stat");
    assert_ne!(before.modified, after.modified);
    assert!(nd.memo().peek::<_, u32>(&Key("parsed")).is_none());
}

#[test]
fn fresh_stat_is_served_from_cache() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lib.go");
    fs::write(&path, "package lib\n").unwrap();

    let vfs = Vfs::with_expiry(|_| None);
    let nd = vfs.poke(&path);
    let before = nd.stat().expect("stat");
    nd.memo().put(Key("parsed"), 1u32);

    bump_mtime(&path, 30);

    let after = nd.stat().expect("stat");
    assert_eq!(before, after);
    assert_eq!(nd.memo().peek::<_, u32>(&Key("parsed")).as_deref(), Some(&1));
}

#[test]
fn file_change_clears_the_parent_memo() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.go");
    fs::write(&path, "package a\n").unwrap();

    let vfs = Vfs::with_expiry(|now| Some(now));
    let file = vfs.poke(&path);
    file.stat().expect("stat");
    let parent = file.parent().expect("parent");
    parent.memo().put(Key("pkg"), "cached".to_string());

    bump_mtime(&path, 60);
    file.stat().expect("stat");

    assert!(parent.memo().peek::<_, String>(&Key("pkg")).is_none());
}

#[test]
fn directory_change_resyncs_children() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("keep.go"), "").unwrap();
    fs::write(root.join("gone.go"), "").unwrap();

    let expire = Arc::new(AtomicBool::new(false));
    let flag = expire.clone();
    let vfs = Vfs::with_expiry(move |now| {
        if flag.load(Ordering::SeqCst) {
            Some(now)
        } else {
            Some(now + Duration::from_secs(3600))
        }
    });
    let nd = vfs.poke(root);
    nd.stat().expect("stat");
    let keep = nd.child("keep.go").expect("listed");

    fs::remove_file(root.join("gone.go")).unwrap();
    fs::create_dir(root.join("fresh")).unwrap();
    expire.store(true, Ordering::SeqCst);
    nd.invalidate();
    let dir_file = File::open(root).expect("open dir");
    let _ = dir_file.set_modified(SystemTime::now() + Duration::from_secs(120));

    let fi = nd.stat().expect("stat");
    assert_eq!(fi.kind, FileKind::Dir);
    let mut names: Vec<String> = nd.children().iter().map(|c| c.name().to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["fresh".to_string(), "keep.go".to_string()]);
    assert!(Arc::ptr_eq(&keep, &nd.child("keep.go").expect("kept")));
}
