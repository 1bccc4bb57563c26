//! # Loupe VFS
//!
//! An in-memory tree mirroring the on-disk layout, used as a coherent cache
//! for everything the agent learns about files: stat results, directory
//! listings, file bytes and arbitrary per-directory memoised values.
//!
//! ## Architecture
//!
//! ```text
//! Vfs (root: "")
//!   │
//!   ├──> poke("/a/b") / peek("/a/b")  → Node
//!   │
//!   └──> Node
//!        ├─> stat()   cached FileInfo until the expiry function says otherwise
//!        │            mod-time change → memo cleared, dirs re-listed
//!        ├─> memo()   per-node key-value store (Memo)
//!        ├─> blob()   file bytes, memoised
//!        └─> locate() nearest ancestor holding a named child (e.g. go.mod)
//! ```
//!
//! Expiry is a caller-supplied function so tests can make cached entries
//! live forever or expire immediately.

mod error;
mod memo;
mod node;
mod scan;

pub use error::{Result, VfsError};
pub use memo::{inv_at, Memo, MemoValue, Sticky};
pub use node::{ExpiryFn, FileInfo, FileKind, Node, DEFAULT_MAX_AGE};
pub use scan::{is_noise_name, ScanEntry, ScanFilter, ScanOptions};

use node::Config;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// The root of a virtual filesystem tree.
#[derive(Clone)]
pub struct Vfs {
    root: Arc<Node>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self::with_expiry(|now| Some(now + DEFAULT_MAX_AGE))
    }

    pub fn with_expiry(
        expiry: impl Fn(Instant) -> Option<Instant> + Send + Sync + 'static,
    ) -> Self {
        Self {
            root: Node::root(Arc::new(Config::new(Box::new(expiry)))),
        }
    }

    /// A process-wide tree for callers without their own instance.
    pub fn global() -> &'static Vfs {
        static GLOBAL: OnceLock<Vfs> = OnceLock::new();
        GLOBAL.get_or_init(Vfs::new)
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Returns the node for `path`, creating missing nodes along the way.
    pub fn poke(&self, path: impl AsRef<Path>) -> Arc<Node> {
        split_path(path.as_ref())
            .iter()
            .fold(self.root.clone(), |nd, name| nd.poke_child(name))
    }

    /// Returns the node for `path` if it is already in the tree.
    pub fn peek(&self, path: impl AsRef<Path>) -> Option<Arc<Node>> {
        let mut nd = self.root.clone();
        for name in split_path(path.as_ref()) {
            nd = nd.child(&name)?;
        }
        Some(nd)
    }

    pub fn stat(&self, path: impl AsRef<Path>) -> Result<FileInfo> {
        self.poke(path).stat()
    }

    pub fn blob(&self, path: impl AsRef<Path>) -> Result<Arc<Vec<u8>>> {
        self.poke(path).blob()
    }

    pub fn read_dir(&self, path: impl AsRef<Path>) -> Result<Arc<Vec<Arc<Node>>>> {
        self.poke(path).read_dir()
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        self.poke(path).is_dir()
    }

    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        self.poke(path).is_file()
    }

    /// Detaches the node for `path` from its parent.
    pub fn remove(&self, path: impl AsRef<Path>) -> Option<Arc<Node>> {
        let names = split_path(path.as_ref());
        let (last, dirs) = names.split_last()?;
        let mut parent = self.root.clone();
        for name in dirs {
            parent = parent.child(name)?;
        }
        parent.remove_child(last)
    }

    /// Renders the tree with box-drawing connectors.
    pub fn print(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "{}", std::path::MAIN_SEPARATOR)?;
        self.root.print(w, "")
    }
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs").finish_non_exhaustive()
    }
}

impl fmt::Display for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print(f)
    }
}

/// Splits a path on both separators, dropping empty components.
pub fn split_path(path: &Path) -> Vec<String> {
    path.to_string_lossy()
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn forever() -> Vfs {
        Vfs::with_expiry(|_| None)
    }

    #[test]
    fn poke_creates_and_peek_finds() {
        let fs = forever();
        assert!(fs.peek("/a/b/c").is_none());
        let c = fs.poke("/a/b/c");
        assert_eq!(c.name(), "c");
        assert_eq!(c.path(), Path::new("/a/b/c"));
        let again = fs.peek("/a/b/c").expect("node exists");
        assert!(Arc::ptr_eq(&c, &again));
        assert!(fs.peek("/a/b").expect("parent").is_branch());
    }

    #[test]
    fn child_names_are_unique() {
        let fs = forever();
        let a = fs.poke("/x/a");
        let b = fs.poke("/x/a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fs.peek("/x").expect("x").children().len(), 1);
    }

    #[test]
    fn add_child_replaces_only_on_kind_change() {
        let fs = forever();
        let dir = fs.poke("/d");
        let first = dir.add_child("n", FileKind::File);
        let same = dir.add_child("n", FileKind::File);
        assert!(Arc::ptr_eq(&first, &same));
        let replaced = dir.add_child("n", FileKind::Dir);
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert_eq!(dir.children().len(), 1);
    }

    #[test]
    fn scan_applies_the_noise_filter() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("a.go"), "package a\n").unwrap();
        fs::write(root.join(".hidden"), "").unwrap();
        fs::create_dir(root.join("_tmp")).unwrap();
        fs::create_dir(root.join("testdata")).unwrap();

        let vfs = forever();
        let nd = vfs
            .scan(root, &ScanOptions::default().skip_noise())
            .expect("scan");
        let names: Vec<String> = nd.children().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["a.go".to_string()]);
    }

    #[test]
    fn scan_rejects_relative_paths() {
        let err = forever()
            .scan("relative/dir", &ScanOptions::default())
            .unwrap_err();
        assert!(matches!(err, VfsError::NotAbsolute(_)));
    }

    #[test]
    fn scan_respects_max_depth() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::write(root.join("a/b/c/deep.go"), "").unwrap();

        let vfs = forever();
        vfs.scan(root, &ScanOptions::default().with_max_depth(2))
            .expect("scan");
        assert!(vfs.peek(root.join("a/b")).is_some());
        assert!(vfs.peek(root.join("a/b/c")).is_none());
    }

    #[test]
    fn stat_missing_node_reports_not_exist() {
        let dir = tempdir().unwrap();
        let err = forever().stat(dir.path().join("nope")).unwrap_err();
        assert!(err.is_not_exist(), "{err}");
    }

    #[test]
    fn remove_detaches_subtree() {
        let fs = forever();
        fs.poke("/r/s/t");
        let removed = fs.remove("/r/s").expect("removed");
        assert_eq!(removed.name(), "s");
        assert!(fs.peek("/r/s").is_none());
        assert!(fs.peek("/r/s/t").is_none());
        assert!(fs.remove("/r/missing").is_none());
    }

    #[test]
    fn locate_walks_up_to_the_nearest_match() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("m/pkg/sub")).unwrap();
        fs::write(root.join("m/go.mod"), "module example.com/m\n").unwrap();

        let vfs = forever();
        let found = vfs
            .poke(root.join("m/pkg/sub"))
            .locate("go.mod")
            .expect("go.mod located");
        assert_eq!(found.path(), root.join("m/go.mod"));
    }

    #[test]
    fn blob_is_memoised_until_the_file_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "one").unwrap();

        let vfs = forever();
        let a = vfs.blob(&path).expect("blob");
        let b = vfs.blob(&path).expect("blob");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.as_slice(), b"one");
    }

    #[test]
    fn print_draws_the_tree() {
        let fs = forever();
        fs.poke("/a/b");
        fs.poke("/a/c");
        fs.poke("/d");
        let mut out = String::new();
        fs.print(&mut out).unwrap();
        let sep = std::path::MAIN_SEPARATOR;
        assert_eq!(
            out,
            format!("{sep}\n├─ a\n│  ├─ b\n│  └─ c\n└─ d\n")
        );
    }

    #[test]
    fn split_path_handles_both_separators() {
        assert_eq!(
            split_path(Path::new("/a\\b//c/")),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
