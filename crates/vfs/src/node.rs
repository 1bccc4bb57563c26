use crate::error::{Result, VfsError};
use crate::memo::Memo;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime};

/// How long a cached stat stays fresh when no expiry function is supplied.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(17);

/// Computes the expiry of a stat taken at the given instant.
///
/// `None` means the cached stat never expires.
pub type ExpiryFn = dyn Fn(Instant) -> Option<Instant> + Send + Sync;

pub(crate) struct Config {
    pub(crate) expiry: Box<ExpiryFn>,
}

impl Config {
    pub(crate) fn new(expiry: Box<ExpiryFn>) -> Self {
        Self { expiry }
    }
}

/// File-mode class of a node. Children are only replaced when this differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    Other,
}

impl FileKind {
    pub fn from_file_type(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            Self::Dir
        } else if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub kind: FileKind,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

#[derive(Debug, Clone, Copy)]
enum Expiry {
    Expired,
    At(Instant),
    Never,
}

impl Expiry {
    fn fresh(self, now: Instant) -> bool {
        match self {
            Self::Expired => false,
            Self::At(at) => now < at,
            Self::Never => true,
        }
    }
}

#[derive(Debug, Clone)]
enum Stat {
    Unknown,
    Found(FileInfo),
    Missing,
}

struct Meta {
    kind: Option<FileKind>,
    stat: Stat,
    expiry: Expiry,
}

impl Meta {
    fn empty(kind: Option<FileKind>) -> Self {
        Self {
            kind,
            stat: Stat::Unknown,
            expiry: Expiry::Expired,
        }
    }
}

struct Inner {
    children: Arc<Vec<Arc<Node>>>,
    meta: Meta,
}

/// A branch or leaf of the [`crate::Vfs`] tree.
pub struct Node {
    parent: Weak<Node>,
    name: String,
    config: Arc<Config>,
    memo: Memo,
    inner: Mutex<Inner>,
}

impl Node {
    pub(crate) fn root(config: Arc<Config>) -> Arc<Self> {
        Self::create(Weak::new(), String::new(), config, None)
    }

    fn create(
        parent: Weak<Node>,
        name: String,
        config: Arc<Config>,
        kind: Option<FileKind>,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent,
            name,
            config,
            memo: Memo::new(),
            inner: Mutex::new(Inner {
                children: Arc::new(Vec::new()),
                meta: Meta::empty(kind),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.parent.upgrade().is_none() && self.name.is_empty()
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    /// The node's absolute path: its chain of names joined with the platform separator.
    pub fn path(&self) -> PathBuf {
        let mut names = vec![self.name.clone()];
        let mut cur = self.parent.upgrade();
        while let Some(nd) = cur {
            if !nd.name.is_empty() {
                names.push(nd.name.clone());
            }
            cur = nd.parent.upgrade();
        }
        names.reverse();
        let joined = names
            .iter()
            .filter(|n| !n.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(std::path::MAIN_SEPARATOR_STR);
        if cfg!(windows) && !joined.is_empty() {
            PathBuf::from(joined)
        } else {
            PathBuf::from(format!("{}{}", std::path::MAIN_SEPARATOR, joined))
        }
    }

    /// The key-value store bound to this node. It is cleared whenever the
    /// node's modification time changes.
    pub fn memo(&self) -> &Memo {
        &self.memo
    }

    /// A snapshot of the child list.
    pub fn children(&self) -> Arc<Vec<Arc<Node>>> {
        self.lock().children.clone()
    }

    pub fn is_branch(&self) -> bool {
        !self.lock().children.is_empty()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.lock().children.iter().find(|c| c.name == name).cloned()
    }

    /// Returns the child called `name`, creating an empty leaf when absent.
    pub fn poke_child(self: &Arc<Self>, name: &str) -> Arc<Node> {
        let mut inner = self.lock();
        if let Some(c) = inner.children.iter().find(|c| c.name == name) {
            return c.clone();
        }
        let child = Self::create(
            Arc::downgrade(self),
            name.to_string(),
            self.config.clone(),
            None,
        );
        let mut list = (*inner.children).clone();
        list.push(child.clone());
        inner.children = Arc::new(list);
        child
    }

    /// Inserts a child of the given kind. An existing child with the same
    /// name is kept unless its kind differs.
    pub fn add_child(self: &Arc<Self>, name: &str, kind: FileKind) -> Arc<Node> {
        let mut inner = self.lock();
        let mut list = (*inner.children).clone();
        if let Some(i) = list.iter().position(|c| c.name == name) {
            if list[i].compatible(kind) {
                return list[i].clone();
            }
            list.remove(i);
        }
        let child = Self::create(
            Arc::downgrade(self),
            name.to_string(),
            self.config.clone(),
            Some(kind),
        );
        list.push(child.clone());
        inner.children = Arc::new(list);
        child
    }

    /// Detaches the child called `name`.
    pub fn remove_child(&self, name: &str) -> Option<Arc<Node>> {
        let mut inner = self.lock();
        let i = inner.children.iter().position(|c| c.name == name)?;
        let mut list = (*inner.children).clone();
        let removed = list.remove(i);
        inner.children = Arc::new(list);
        Some(removed)
    }

    fn kind(&self) -> Option<FileKind> {
        let inner = self.lock();
        match &inner.meta.stat {
            Stat::Found(fi) => Some(fi.kind),
            _ => inner.meta.kind,
        }
    }

    fn compatible(&self, kind: FileKind) -> bool {
        self.kind().map_or(true, |k| k == kind)
    }

    /// Replaces the child list with `entries`, keeping existing nodes whose
    /// name and kind still match.
    pub(crate) fn sync_children(self: &Arc<Self>, entries: Vec<(String, FileKind)>) {
        let mut inner = self.lock();
        let old = inner.children.clone();
        let list = entries
            .into_iter()
            .map(|(name, kind)| {
                match old.iter().find(|c| c.name == name && c.compatible(kind)) {
                    Some(c) => c.clone(),
                    None => Self::create(Arc::downgrade(self), name, self.config.clone(), Some(kind)),
                }
            })
            .collect();
        inner.children = Arc::new(list);
    }

    /// Returns the cached file info, refreshing it from disk once expired.
    pub fn stat(self: &Arc<Self>) -> Result<FileInfo> {
        let now = Instant::now();
        {
            let inner = self.lock();
            if inner.meta.expiry.fresh(now) {
                match &inner.meta.stat {
                    Stat::Found(fi) => return Ok(fi.clone()),
                    Stat::Missing => return Err(VfsError::NotExist(self.path())),
                    Stat::Unknown => {}
                }
            }
        }
        self.sync(now)
    }

    fn expiry_at(&self, now: Instant) -> Expiry {
        match (self.config.expiry)(now) {
            Some(at) => Expiry::At(at),
            None => Expiry::Never,
        }
    }

    fn sync(self: &Arc<Self>, now: Instant) -> Result<FileInfo> {
        let path = self.path();
        let md = match fs::metadata(&path) {
            Ok(md) => md,
            Err(err) => {
                let expiry = self.expiry_at(now);
                let existed = {
                    let mut inner = self.lock();
                    let existed = matches!(inner.meta.stat, Stat::Found(_));
                    inner.meta = Meta {
                        kind: None,
                        stat: Stat::Missing,
                        expiry,
                    };
                    if !self.is_root() {
                        inner.children = Arc::new(Vec::new());
                    }
                    existed
                };
                if existed {
                    self.memo.clear();
                }
                if err.kind() == std::io::ErrorKind::NotFound {
                    return Err(VfsError::NotExist(path));
                }
                return Err(VfsError::IoError(err));
            }
        };

        let info = FileInfo {
            name: self.name.clone(),
            kind: FileKind::from_file_type(md.file_type()),
            len: md.len(),
            modified: md.modified().ok(),
        };
        // The first observation of a node only fills the cache: anything
        // memoised before it was derived from the same on-disk state.
        let (changed, first_seen) = {
            let mut inner = self.lock();
            let (changed, first_seen) = match &inner.meta.stat {
                Stat::Found(prev) => (
                    prev.modified != info.modified || prev.kind != info.kind,
                    false,
                ),
                Stat::Missing => (true, false),
                Stat::Unknown => (true, true),
            };
            inner.meta = Meta {
                kind: Some(info.kind),
                stat: Stat::Found(info.clone()),
                expiry: self.expiry_at(now),
            };
            (changed, first_seen)
        };
        if !changed {
            return Ok(info);
        }

        if !first_seen {
            self.memo.clear();
        }
        match info.kind {
            FileKind::Dir => self.rescan(&path),
            _ if first_seen => {}
            _ => {
                if let Some(parent) = self.parent() {
                    parent.memo.clear();
                }
            }
        }
        Ok(info)
    }

    fn rescan(self: &Arc<Self>, path: &Path) {
        let dir = match fs::read_dir(path) {
            Ok(dir) => dir,
            Err(err) => {
                log::debug!("vfs: cannot read dir {}: {err}", path.display());
                return;
            }
        };
        let entries = dir
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let kind = FileKind::from_file_type(e.file_type().ok()?);
                Some((e.file_name().to_string_lossy().into_owned(), kind))
            })
            .collect();
        self.sync_children(entries);
    }

    /// Forces the next [`Node::stat`] to hit the disk.
    pub fn invalidate(&self) {
        self.lock().meta.expiry = Expiry::Expired;
    }

    pub fn is_dir(self: &Arc<Self>) -> bool {
        self.stat().map(|fi| fi.kind == FileKind::Dir).unwrap_or(false)
    }

    pub fn is_file(self: &Arc<Self>) -> bool {
        self.stat()
            .map(|fi| fi.kind == FileKind::File)
            .unwrap_or(false)
    }

    /// Lists the directory's children, refreshing the listing when stale.
    pub fn read_dir(self: &Arc<Self>) -> Result<Arc<Vec<Arc<Node>>>> {
        let fi = self.stat()?;
        if !fi.is_dir() {
            return Err(VfsError::NotDir(self.path()));
        }
        Ok(self.children())
    }

    /// Returns the file's bytes, memoised until the file changes.
    pub fn blob(self: &Arc<Self>) -> Result<Arc<Vec<u8>>> {
        #[derive(Clone, PartialEq)]
        struct BlobKey;

        let fi = self.stat()?;
        if fi.is_dir() {
            return Err(VfsError::Other(format!(
                "`{}` is a directory",
                self.path().display()
            )));
        }
        if let Some(b) = self.memo.peek::<_, Vec<u8>>(&BlobKey) {
            return Ok(b);
        }
        let bytes = fs::read(self.path())?;
        Ok(self.memo.put(BlobKey, bytes))
    }

    /// Walks up from this node looking for a directory containing `name`.
    pub fn locate(self: &Arc<Self>, name: &str) -> Option<Arc<Node>> {
        let mut cur = Some(self.clone());
        while let Some(dir) = cur {
            let candidate = dir.poke_child(name);
            if candidate.stat().is_ok() {
                return Some(candidate);
            }
            cur = dir.parent();
        }
        None
    }

    pub(crate) fn print(&self, w: &mut dyn fmt::Write, prefix: &str) -> fmt::Result {
        let children = self.children();
        for (i, c) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let (branch, indent) = if last { ("└─ ", "   ") } else { ("├─ ", "│  ") };
            writeln!(w, "{prefix}{branch}{}", c.name)?;
            c.print(w, &format!("{prefix}{indent}"))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.path())
            .field("children", &self.children().len())
            .finish()
    }
}
