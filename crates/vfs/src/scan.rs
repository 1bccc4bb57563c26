use crate::error::{Result, VfsError};
use crate::node::{FileKind, Node};
use crate::Vfs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::{DirEntry, WalkDir};

/// An entry offered to a scan filter.
#[derive(Debug, Clone, Copy)]
pub struct ScanEntry<'a> {
    pub path: &'a Path,
    pub name: &'a str,
    pub kind: FileKind,
    pub depth: usize,
}

pub type ScanFilter = dyn Fn(&ScanEntry<'_>) -> bool + Send + Sync;

/// Options for [`Vfs::scan`].
#[derive(Clone)]
pub struct ScanOptions {
    /// Maximum depth below the scan root (1 = direct children only).
    pub max_depth: usize,
    /// Returns `false` to skip an entry (and, for directories, everything below it).
    pub filter: Option<Arc<ScanFilter>>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_depth: 1,
            filter: None,
        }
    }
}

impl ScanOptions {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_filter(
        mut self,
        filter: impl Fn(&ScanEntry<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Skips dot and underscore names, `testdata` and `node_modules`.
    pub fn skip_noise(self) -> Self {
        self.with_filter(|e| !is_noise_name(e.name))
    }
}

pub fn is_noise_name(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_') || name == "testdata" || name == "node_modules"
}

fn entry_kind(entry: &DirEntry) -> FileKind {
    FileKind::from_file_type(entry.file_type())
}

impl Vfs {
    /// Populates the tree below `root` without loading any file bytes.
    pub fn scan(&self, root: impl AsRef<Path>, opts: &ScanOptions) -> Result<Arc<Node>> {
        let root = root.as_ref();
        if !root.is_absolute() {
            return Err(VfsError::NotAbsolute(root.to_path_buf()));
        }
        let root_nd = self.poke(root);
        root_nd.stat()?;

        let mut listings: BTreeMap<PathBuf, Vec<(String, FileKind)>> = BTreeMap::new();
        listings.insert(root.to_path_buf(), Vec::new());

        let filter = opts.filter.clone();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(opts.max_depth.max(1))
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| {
                let Some(filter) = &filter else {
                    return true;
                };
                let name = e.file_name().to_string_lossy();
                filter(&ScanEntry {
                    path: e.path(),
                    name: &name,
                    kind: entry_kind(e),
                    depth: e.depth(),
                })
            });

        let mut seen = 0usize;
        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("vfs: scan of {} failed on an entry: {e}", root.display());
                    continue;
                }
            };
            seen += 1;
            let kind = entry_kind(&entry);
            if kind == FileKind::Dir && entry.depth() < opts.max_depth {
                listings.entry(entry.path().to_path_buf()).or_default();
            }
            if let Some(parent) = entry.path().parent() {
                listings
                    .entry(parent.to_path_buf())
                    .or_default()
                    .push((entry.file_name().to_string_lossy().into_owned(), kind));
            }
        }

        for (dir, entries) in listings {
            self.poke(&dir).sync_children(entries);
        }
        log::debug!("vfs: scanned {} entries below {}", seen, root.display());
        Ok(root_nd)
    }
}
