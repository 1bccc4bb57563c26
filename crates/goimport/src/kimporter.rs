//! Kim-Porter: the concurrent, memoising, cycle-aware package importer.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use loupe_store::{Ctx, Profile};
use loupe_vfs::{inv_at, Memo, Sticky, Vfs};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use tokio_util::sync::CancellationToken;

use crate::build::{clean_path, BuildContext, SourceReader};
use crate::cgo;
use crate::check::{
    ArchiveReader, CheckConfig, CheckRequest, ExportDataReader, Package, PackageImporter,
    ShallowChecker, SourceFile, TypeChecker, TypeError,
};
use crate::error::{ImportError, Result};
use crate::limits::effective_concurrency;
use crate::parse::{parse_file, ParseMode};
use crate::pkg::PkgPath;
use crate::resolve::find_pkg;

/// Importer settings fixed for the lifetime of one [`Importer`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// In-memory file contents that shadow the disk.
    pub src_map: HashMap<PathBuf, Vec<u8>>,
    /// Check function bodies of the entry package.
    pub check_funcs: bool,
    /// Report unused imports in the entry package.
    pub check_imports: bool,
    /// Include `_test.go` files of the entry package.
    pub tests: bool,
    /// Import dependencies one at a time.
    pub no_concurrency: bool,
    /// Dependency import workers per package; 0 picks the process default.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
struct Flags {
    check_funcs: bool,
    check_imports: bool,
    tests: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateKey {
    import_path: String,
    dir: PathBuf,
    flags: Flags,
    tags: String,
    goarch: String,
    goos: String,
    goroot: PathBuf,
    gopath: String,
    src_map_hash: String,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The shared record of one package under one build configuration.
///
/// It lives in the memo of the package directory's VFS node and survives
/// memo clears: a clear only bumps `inv_at`, which also propagates to every
/// package that imported this one.
struct PkgState {
    key: StateKey,
    chk_at: AtomicU64,
    inv_at: AtomicU64,
    imby: Mutex<Vec<Weak<PkgState>>>,
    result: Mutex<Option<Result<Arc<Package>>>>,
}

impl PkgState {
    fn new(key: StateKey) -> Self {
        Self {
            key,
            chk_at: AtomicU64::new(0),
            inv_at: AtomicU64::new(0),
            imby: Mutex::new(Vec::new()),
            result: Mutex::new(None),
        }
    }

    fn label(&self) -> String {
        format!("{}({})", self.key.import_path, self.key.dir.display())
    }

    fn imported_by(&self, parent: &Arc<PkgState>) {
        let mut imby = lock(&self.imby);
        imby.retain(|w| w.strong_count() > 0);
        if !imby.iter().any(|w| w.as_ptr() == Arc::as_ptr(parent)) {
            imby.push(Arc::downgrade(parent));
        }
    }

    fn invalidate(&self, at: u64) {
        if self.inv_at.fetch_max(at, Ordering::SeqCst) >= at {
            return;
        }
        let parents: Vec<Arc<PkgState>> = lock(&self.imby).iter().filter_map(Weak::upgrade).collect();
        for p in parents {
            p.invalidate(at);
        }
    }

    /// Checked, and not invalidated since the check started.
    fn valid(&self) -> bool {
        let chk_at = self.chk_at.load(Ordering::SeqCst);
        chk_at != 0 && self.inv_at.load(Ordering::SeqCst) < chk_at
    }
}

impl Sticky for PkgState {
    fn invalidate_memo(&self, at: u64) {
        self.invalidate(at);
    }
}

impl fmt::Debug for PkgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkgState")
            .field("key", &self.key)
            .field("valid", &self.valid())
            .finish_non_exhaustive()
    }
}

/// Cached results are handed out as they were stored, except that a package
/// the checker never completed is reported as such.
fn outcome(import_path: &str, res: &Result<Arc<Package>>) -> Result<Arc<Package>> {
    match res {
        Ok(pkg) if !pkg.complete => Err(ImportError::Partial(import_path.to_string())),
        other => other.clone(),
    }
}

/// One step of the chain of packages currently being imported.
struct Link {
    state: Arc<PkgState>,
    parent: Option<Arc<Link>>,
}

impl Link {
    fn holds(&self, ks: &PkgState) -> bool {
        self.iter().any(|l| std::ptr::eq(Arc::as_ptr(&l.state), ks))
    }

    fn iter(&self) -> impl Iterator<Item = &Link> {
        std::iter::successors(Some(self), |l| l.parent.as_deref())
    }
}

/// An importer blocked on a busy state. Every state on its chain stays
/// locked until `want` is released, so each of them waits on `want`.
struct Wait {
    id: u64,
    held: Vec<usize>,
    want: Arc<PkgState>,
}

/// Importers currently blocked on a busy state. Catches cycles split across
/// workers, which no single chain sees.
static WAITS: Mutex<Vec<Wait>> = Mutex::new(Vec::new());
static WAIT_ID: AtomicU64 = AtomicU64::new(0);

/// Reports whether waiting for `want` could block on a state held by `chain`.
fn waits_on_chain(waits: &[Wait], want: &Arc<PkgState>, chain: &Link) -> bool {
    let mut stack = vec![want.clone()];
    let mut seen = Vec::new();
    while let Some(cur) = stack.pop() {
        if chain.holds(&cur) {
            return true;
        }
        let at = Arc::as_ptr(&cur) as usize;
        if seen.contains(&at) {
            continue;
        }
        seen.push(at);
        stack.extend(
            waits
                .iter()
                .filter(|w| w.held.contains(&at))
                .map(|w| w.want.clone()),
        );
    }
    false
}

#[derive(Clone)]
struct Services {
    vfs: Vfs,
    kv: Option<Arc<Memo>>,
    reader: SourceReader,
    checker: Arc<dyn TypeChecker>,
    export_reader: Arc<dyn ExportDataReader>,
    cancel: CancellationToken,
    profile: Arc<Profile>,
}

/// Imports Go packages for type checking.
///
/// Cloning is cheap. A clone shares the caches of the original, which live
/// in the VFS, so independent importers over the same VFS and build settings
/// check each package once.
#[derive(Clone)]
pub struct Importer {
    svc: Arc<Services>,
    bld: Arc<BuildContext>,
    cfg: Arc<Config>,
    flags: Flags,
    src_map_hash: String,
    chain: Option<Arc<Link>>,
}

impl fmt::Debug for Importer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Importer")
            .field("goroot", &self.bld.goroot)
            .field("goos", &self.bld.goos)
            .field("goarch", &self.bld.goarch)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Importer {
    pub fn new(bld: BuildContext, vfs: Vfs, cfg: Config) -> Self {
        let src_map_hash = src_map_hash(&cfg.src_map);
        let reader = SourceReader::new(vfs.clone()).with_overrides(Arc::new(cfg.src_map.clone()));
        Self {
            svc: Arc::new(Services {
                vfs,
                kv: None,
                reader,
                checker: Arc::new(ShallowChecker),
                export_reader: Arc::new(ArchiveReader),
                cancel: CancellationToken::new(),
                profile: Arc::new(Profile::disabled()),
            }),
            bld: Arc::new(bld),
            flags: Flags {
                check_funcs: cfg.check_funcs,
                check_imports: cfg.check_imports,
                tests: cfg.tests,
            },
            cfg: Arc::new(cfg),
            src_map_hash,
            chain: None,
        }
    }

    /// An importer wired to a reducer's context: its environment, VFS,
    /// parse cache, active view, cancellation and profile.
    pub fn from_ctx(mx: &Ctx, cfg: Config) -> Self {
        Self::new(BuildContext::from_env(mx.env()), mx.vfs.clone(), cfg)
            .with_kv(mx.store.kv())
            .with_view(mx.view().clone())
            .with_cancel(mx.cancel.clone())
            .with_profile(mx.profile.clone())
    }

    pub fn with_checker(mut self, checker: Arc<dyn TypeChecker>) -> Self {
        Arc::make_mut(&mut self.svc).checker = checker;
        self
    }

    pub fn with_export_reader(mut self, reader: Arc<dyn ExportDataReader>) -> Self {
        Arc::make_mut(&mut self.svc).export_reader = reader;
        self
    }

    /// Memoises parsed files in `kv`.
    pub fn with_kv(mut self, kv: Arc<Memo>) -> Self {
        Arc::make_mut(&mut self.svc).kv = Some(kv);
        self
    }

    /// Reads the view's file from its buffer instead of the disk.
    ///
    /// A non-empty buffer joins the source map, so packages checked against
    /// one buffer are not reused for another.
    pub fn with_view(mut self, view: loupe_store::View) -> Self {
        if !view.src.is_empty() {
            let cfg = Arc::make_mut(&mut self.cfg);
            cfg.src_map.insert(view.filename(), view.src.clone());
            self.src_map_hash = src_map_hash(&cfg.src_map);
            let overrides = Arc::new(cfg.src_map.clone());
            let svc = Arc::make_mut(&mut self.svc);
            svc.reader = svc.reader.clone().with_overrides(overrides);
        }
        let svc = Arc::make_mut(&mut self.svc);
        svc.reader = svc.reader.clone().with_view(Some(view));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        Arc::make_mut(&mut self.svc).cancel = cancel;
        self
    }

    pub fn with_profile(mut self, profile: Arc<Profile>) -> Self {
        Arc::make_mut(&mut self.svc).profile = profile;
        self
    }

    pub fn build_context(&self) -> &BuildContext {
        &self.bld
    }

    /// Imports `import_path` as seen from `src_dir`. Only mode 0 is supported.
    pub fn import_from(&self, import_path: &str, src_dir: &Path, mode: u32) -> Result<Arc<Package>> {
        if mode != 0 {
            return Err(ImportError::Mode(mode));
        }
        match import_path {
            "C" => return Ok(Package::fake_c()),
            "unsafe" => return Ok(Package::unsafe_pkg()),
            _ => {}
        }
        let src_dir = std::path::absolute(src_dir)?;
        if !src_dir.is_absolute() {
            return Err(ImportError::SrcDirNotAbsolute(src_dir));
        }
        let src_dir = clean_path(&src_dir);
        let pp = {
            let _frame = self.svc.profile.push("findPkg");
            find_pkg(&self.bld, &self.svc.vfs, import_path, &src_dir)?
        };
        self.import_pkg(&pp)
    }

    fn import_pkg(&self, pp: &PkgPath) -> Result<Arc<Package>> {
        if pp.goroot && self.bld.goos != "js" && pp.dir == self.bld.goroot_src().join("syscall").join("js") {
            let mut kx = self.clone();
            kx.bld = Arc::new(self.bld.with_target("js", "wasm"));
            return kx.import_pkg(pp);
        }

        let _frame = self.svc.profile.push(&format!("import({})", pp.import_path));
        self.detect_cycle(pp)?;

        let ks = self.state(pp);
        if let Some(link) = &self.chain {
            ks.imported_by(&link.state);
        }

        let mut slot = self.lock_state(&ks, pp)?;
        if ks.valid() {
            if let Some(res) = slot.as_ref() {
                return outcome(&pp.import_path, res);
            }
        }
        let stamp = inv_at();
        let res = self.check(&ks, pp).map(Arc::new);
        match &res {
            Err(err) if err.is_cycle() => {}
            _ => ks.chk_at.store(stamp, Ordering::SeqCst),
        }
        *slot = Some(res.clone());
        outcome(&pp.import_path, &res)
    }

    /// Fails when `pp` is already being imported further up the chain.
    fn detect_cycle(&self, pp: &PkgPath) -> Result<()> {
        let mut link = self.chain.as_deref();
        let mut names = vec![format!("{}({})", pp.import_path, pp.dir.display())];
        let mut found = false;
        while let Some(l) = link {
            names.push(l.state.label());
            if l.state.key.dir == pp.dir {
                found = true;
                break;
            }
            link = l.parent.as_deref();
        }
        if found {
            return Err(ImportError::Cycle(names.join(" <~ ")));
        }
        Ok(())
    }

    /// Locks `ks`'s result, failing with a cycle instead of waiting on a
    /// state whose importer is itself waiting on this chain.
    fn lock_state<'a>(
        &self,
        ks: &'a Arc<PkgState>,
        pp: &PkgPath,
    ) -> Result<MutexGuard<'a, Option<Result<Arc<Package>>>>> {
        match ks.result.try_lock() {
            Ok(slot) => return Ok(slot),
            Err(TryLockError::Poisoned(e)) => return Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => {}
        }
        let Some(link) = &self.chain else {
            return Ok(lock(&ks.result));
        };
        let id = WAIT_ID.fetch_add(1, Ordering::SeqCst);
        {
            let mut waits = lock(&WAITS);
            if waits_on_chain(&waits, ks, link) {
                let mut names = vec![format!("{}({})", pp.import_path, pp.dir.display())];
                names.extend(link.iter().map(|l| l.state.label()));
                return Err(ImportError::Cycle(names.join(" <~ ")));
            }
            waits.push(Wait {
                id,
                held: link.iter().map(|l| Arc::as_ptr(&l.state) as usize).collect(),
                want: ks.clone(),
            });
        }
        let slot = lock(&ks.result);
        let mut waits = lock(&WAITS);
        if let Some(i) = waits.iter().position(|w| w.id == id) {
            waits.swap_remove(i);
        }
        Ok(slot)
    }

    fn state(&self, pp: &PkgPath) -> Arc<PkgState> {
        let key = StateKey {
            import_path: pp.import_path.clone(),
            dir: pp.dir.clone(),
            flags: self.flags,
            tags: self.bld.tags_str(),
            goarch: self.bld.goarch.clone(),
            goos: self.bld.goos.clone(),
            goroot: self.bld.goroot.clone(),
            gopath: self.bld.gopath_str(),
            src_map_hash: self.src_map_hash.clone(),
        };
        // Refresh the directory and its sources first so a changed file
        // invalidates the state before it is consulted.
        let nd = self.svc.vfs.poke(&pp.dir);
        match nd.read_dir() {
            Ok(ls) => {
                for c in ls.iter().filter(|c| c.name().ends_with(".go")) {
                    let _ = c.stat();
                }
            }
            Err(err) => log::debug!("Kim-Porter: read_dir {}: {err}", pp.dir.display()),
        }
        nd.memo().read_sticky(key.clone(), || PkgState::new(key))
    }

    /// The importer used for `ks`'s dependencies: same services, none of the
    /// entry package's strictness, and `ks` appended to the import chain.
    fn branch(&self, ks: &Arc<PkgState>) -> Importer {
        Importer {
            flags: Flags::default(),
            chain: Some(Arc::new(Link {
                state: ks.clone(),
                parent: self.chain.clone(),
            })),
            ..self.clone()
        }
    }

    fn check(&self, ks: &Arc<PkgState>, pp: &PkgPath) -> Result<Package> {
        let files = self.parse_dir(pp)?;
        let kx = self.branch(ks);
        let imports = kx.import_deps(&files, &pp.dir)?;

        if files.iter().any(|f| f.parsed.is_cgo()) {
            match self.import_cgo(pp, &imports) {
                Ok(pkg) => return Ok(pkg),
                Err(err) => log::debug!("{err}"),
            }
        }

        let _frame = self.svc.profile.push("typeCheck");
        let mut hard: Option<TypeError> = None;
        let req = CheckRequest {
            import_path: &pp.import_path,
            dir: &pp.dir,
            files: &files,
            imports: &imports,
            importer: &kx,
            config: CheckConfig {
                fake_import_c: true,
                ignore_func_bodies: !self.flags.check_funcs,
                disable_unused_import_check: !self.flags.check_imports,
            },
        };
        let pkg = self.svc.checker.check(&req, &mut |err| {
            if !err.soft && hard.is_none() {
                hard = Some(err);
            }
        });
        if let Some(err) = hard {
            return Err(ImportError::Check {
                path: err.path,
                row: err.row,
                col: err.col,
                message: err.message,
            });
        }
        pkg
    }

    fn source_names(&self, dir: &Path) -> Result<BTreeSet<String>> {
        let mut names: BTreeSet<String> = self
            .svc
            .vfs
            .read_dir(dir)?
            .iter()
            .map(|nd| nd.name().to_string())
            .collect();
        for path in self.cfg.src_map.keys() {
            if path.parent() == Some(dir) {
                if let Some(nm) = path.file_name() {
                    names.insert(nm.to_string_lossy().into_owned());
                }
            }
        }
        names.retain(|nm| {
            nm.ends_with(".go")
                && !nm.starts_with('.')
                && !nm.starts_with('_')
                && (self.flags.tests || !nm.ends_with("_test.go"))
                && self.bld.match_file_name(nm)
        });
        Ok(names)
    }

    fn parse_dir(&self, pp: &PkgPath) -> Result<Vec<SourceFile>> {
        let _frame = self.svc.profile.push("parseDir");
        let names: Vec<String> = self.source_names(&pp.dir)?.into_iter().collect();
        let mode = if self.flags.check_funcs {
            ParseMode::Full
        } else {
            ParseMode::SkipFuncBodies
        };
        let workers = if self.cfg.no_concurrency {
            1
        } else {
            effective_concurrency(self.cfg.concurrency)
        };
        let parsed = fan_out(&names, workers, |nm| {
            let path = pp.dir.join(nm);
            let src = self.svc.reader.read(&path)?;
            if !self.bld.match_constraints(&src) {
                return Ok(None);
            }
            let parsed = parse_file(self.svc.kv.as_deref(), &src, mode);
            if let Some(e) = &parsed.error {
                return Err(ImportError::Parse {
                    path,
                    row: e.row,
                    col: e.col,
                    message: e.message.clone(),
                });
            }
            Ok(Some(SourceFile { path, parsed }))
        })?;

        let (mut go, mut cgo, mut tests) = (Vec::new(), Vec::new(), Vec::new());
        for sf in parsed.into_iter().flatten() {
            if sf.parsed.package.ends_with("_test") {
                continue;
            }
            let is_test = sf.path.to_string_lossy().ends_with("_test.go");
            if is_test {
                tests.push(sf);
            } else if sf.parsed.is_cgo() {
                cgo.push(sf);
            } else {
                go.push(sf);
            }
        }
        go.append(&mut cgo);
        go.append(&mut tests);
        if go.is_empty() {
            return Err(ImportError::NoGo(pp.dir.clone()));
        }
        Ok(go)
    }

    /// Imports every dependency named by `files`, fanning out across workers
    /// when there is more than one. The first failure wins.
    fn import_deps(&self, files: &[SourceFile], dir: &Path) -> Result<HashMap<String, Arc<Package>>> {
        let mut seen = BTreeSet::new();
        let mut specs = Vec::new();
        for sf in files {
            for spec in &sf.parsed.imports {
                if seen.insert(spec.path.as_str()) {
                    specs.push((sf.path.as_path(), spec));
                }
            }
        }
        let workers = if self.cfg.no_concurrency {
            1
        } else {
            effective_concurrency(self.cfg.concurrency)
        };
        let pkgs = fan_out(&specs, workers, |(path, spec)| {
            self.import_from(&spec.path, dir, 0)
                .map(|pkg| (spec.path.clone(), pkg))
                .map_err(|err| ImportError::Import {
                    path: path.to_path_buf(),
                    row: spec.row,
                    col: spec.col,
                    source: Box::new(err),
                })
        })?;
        Ok(pkgs.into_iter().collect())
    }

    fn import_cgo(&self, pp: &PkgPath, imports: &HashMap<String, Arc<Package>>) -> Result<Package> {
        let _frame = self.svc.profile.push("importCgoPkg");
        let env = self
            .bld
            .env()
            .add("GOOS", self.bld.goos.as_str())
            .add("GOARCH", self.bld.goarch.as_str());
        let go = cgo::go_tool(&self.bld.goroot);
        let archive = cgo::export_archive(&go, &pp.dir, &env, &self.svc.cancel)?;
        self.svc.export_reader.read(&pp.import_path, &archive, imports)
    }
}

impl PackageImporter for Importer {
    fn import_from(&self, import_path: &str, src_dir: &Path, mode: u32) -> Result<Arc<Package>> {
        Importer::import_from(self, import_path, src_dir, mode)
    }
}

/// Runs `f` over `items` on up to `workers` threads, keeping input order.
/// Workers stop picking up items after the first error, which is returned.
fn fan_out<T, R, F>(items: &[T], workers: usize, f: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    if workers < 2 || items.len() < 2 {
        return items.iter().map(&f).collect();
    }
    let next = AtomicUsize::new(0);
    let failed: Mutex<Option<ImportError>> = Mutex::new(None);
    let slots: Vec<Mutex<Option<R>>> = items.iter().map(|_| Mutex::new(None)).collect();
    std::thread::scope(|s| {
        for _ in 0..workers.min(items.len()) {
            s.spawn(|| loop {
                if lock(&failed).is_some() {
                    break;
                }
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(i) else {
                    break;
                };
                match f(item) {
                    Ok(r) => *lock(&slots[i]) = Some(r),
                    Err(err) => {
                        lock(&failed).get_or_insert(err);
                        break;
                    }
                }
            });
        }
    });
    if let Some(err) = failed.into_inner().unwrap_or_else(|e| e.into_inner()) {
        return Err(err);
    }
    Ok(slots
        .into_iter()
        .filter_map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
        .collect())
}

/// Identifies the contents of `src_map`; empty when there is nothing in it.
fn src_map_hash(src_map: &HashMap<PathBuf, Vec<u8>>) -> String {
    if src_map.is_empty() {
        return String::new();
    }
    let mut paths: Vec<&PathBuf> = src_map.keys().collect();
    paths.sort();
    let mut h = Sha256::new();
    for p in paths {
        h.update(p.to_string_lossy().as_bytes());
        h.update([0]);
        h.update(&src_map[p]);
        h.update([0]);
    }
    URL_SAFE_NO_PAD.encode(h.finalize())
}
