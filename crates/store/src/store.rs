use crate::action::{Action, Unmount};
use crate::ctx::Ctx;
use crate::error::{Result, StoreError};
use crate::profile::Profile;
use crate::reducer::Reducer;
use crate::state::State;
use loupe_vfs::{Memo, Vfs};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type Listener = dyn Fn(&Ctx) + Send + Sync;

/// Adjusts the freshly reset state before reducers see it.
pub type Prepare = Box<dyn FnOnce(State) -> State + Send>;

enum Job {
    Reduce {
        action: Arc<dyn Action>,
        cookie: String,
        prepare: Option<Prepare>,
    },
    Flush(oneshot::Sender<()>),
    Run(Box<dyn FnOnce(&State) + Send>),
    Unmount(oneshot::Sender<()>),
}

struct Slot {
    reducer: Box<dyn Reducer>,
    label: String,
    initialized: bool,
    mounted: bool,
}

/// Everything a store is built from.
pub struct StoreConfig {
    pub state: State,
    pub vfs: Vfs,
    pub profile: Arc<Profile>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state: State::default(),
            vfs: Vfs::new(),
            profile: Arc::new(Profile::new("store")),
        }
    }
}

struct Inner {
    state: Mutex<State>,
    incoming: Mutex<Vec<Slot>>,
    reducers: Mutex<Vec<Slot>>,
    listeners: Mutex<Vec<(u64, Arc<Listener>)>>,
    next_listener: AtomicU64,
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    vfs: Vfs,
    profile: Arc<Profile>,
    cancel: CancellationToken,
    kv: Arc<Memo>,
}

/// Owner of the state and the reducer pipeline.
///
/// Dispatches are queued and reduced one at a time by a single dispatcher
/// task, in dispatch order. Cloning a `Store` yields another handle to the
/// same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs one reducer hook, turning a panic into an error on the state.
fn shield<T>(mx: &mut Ctx, label: &str, hook: &str, f: impl FnOnce(&Ctx) -> T) -> Option<T> {
    let res = {
        let mx = &*mx;
        catch_unwind(AssertUnwindSafe(|| f(mx)))
    };
    match res {
        Ok(v) => Some(v),
        Err(payload) => {
            let err = format!(
                "{} PANIC: {label}.{hook}: {}",
                mx.label(),
                panic_message(payload.as_ref())
            );
            log::error!("{err}");
            mx.state = std::mem::take(&mut mx.state).add_error(err);
            None
        }
    }
}

impl Slot {
    fn step(&mut self, mx: &mut Ctx) {
        let label = self.label.as_str();
        let reducer = &mut self.reducer;
        if !self.initialized {
            self.initialized = true;
            shield(mx, label, "init", |mx| reducer.init(mx));
        }

        let cond = shield(mx, label, "cond", |mx| reducer.cond(mx)).unwrap_or(self.mounted);
        if cond && !self.mounted {
            self.mounted = true;
            shield(mx, label, "mount", |mx| reducer.mount(mx));
        } else if !cond && self.mounted {
            self.mounted = false;
            shield(mx, label, "unmount", |mx| reducer.unmount(mx));
        }
        if !self.mounted {
            return;
        }

        if let Some(Some(config)) = shield(mx, label, "config", |mx| reducer.config(mx)) {
            mx.state.config = Some(config);
        }
        if let Some(state) = shield(mx, label, "reduce", |mx| reducer.reduce(mx)) {
            mx.state = state;
        }
    }
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(config.state),
                incoming: Mutex::new(Vec::new()),
                reducers: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                tx,
                rx: Mutex::new(Some(rx)),
                vfs: config.vfs,
                profile: config.profile,
                cancel: CancellationToken::new(),
                kv: Arc::new(Memo::new()),
            }),
        }
    }

    /// Appends a reducer to the pipeline. Order is significant and reducers
    /// cannot be removed.
    pub fn use_reducer(&self, reducer: impl Reducer) -> &Self {
        self.use_boxed(Box::new(reducer))
    }

    pub fn use_boxed(&self, reducer: Box<dyn Reducer>) -> &Self {
        let label = reducer.label();
        lock(&self.inner.incoming).push(Slot {
            reducer,
            label,
            initialized: false,
            mounted: false,
        });
        self
    }

    /// Spawns the dispatcher. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let rx = lock(&self.inner.rx)
            .take()
            .ok_or_else(|| StoreError::Other("store already started".to_string()))?;
        let store = self.clone();
        Ok(tokio::spawn(store.run(rx)))
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Reduce {
                    action,
                    cookie,
                    prepare,
                } => {
                    let store = self.clone();
                    let task = tokio::task::spawn_blocking(move || {
                        store.reduce(action, cookie, prepare)
                    });
                    if let Err(err) = task.await {
                        log::error!("store: reduction task failed: {err}");
                    }
                }
                Job::Flush(done) => {
                    let _ = done.send(());
                }
                Job::Run(f) => {
                    let store = self.clone();
                    let task = tokio::task::spawn_blocking(move || f(&store.state()));
                    if let Err(err) = task.await {
                        log::error!("store: queued task failed: {err}");
                    }
                }
                Job::Unmount(done) => {
                    let store = self.clone();
                    if let Err(err) = tokio::task::spawn_blocking(move || store.unmount_all()).await {
                        log::error!("store: unmount task failed: {err}");
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }
        log::debug!("store: dispatcher stopped");
    }

    fn send(&self, job: Job) -> bool {
        if self.inner.tx.send(job).is_err() {
            log::debug!("store: dispatcher is gone, dropping job");
            return false;
        }
        true
    }

    /// Queues `action` for reduction and returns immediately.
    pub fn dispatch(&self, action: impl Action) {
        self.dispatch_with(Arc::new(action), String::new(), None);
    }

    /// Queues an action tagged with a request cookie; `prepare` runs on the
    /// reset state before the reducers.
    pub fn dispatch_with(&self, action: Arc<dyn Action>, cookie: String, prepare: Option<Prepare>) {
        self.send(Job::Reduce {
            action,
            cookie,
            prepare,
        });
    }

    /// Queues `f` behind everything dispatched so far; it runs on the
    /// dispatcher with the state those reductions produced.
    pub fn run_after(&self, f: impl FnOnce(&State) + Send + 'static) {
        self.send(Job::Run(Box::new(f)));
    }

    /// Waits until everything dispatched so far has been reduced.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Job::Flush(tx)) {
            let _ = rx.await;
        }
    }

    /// Reduces what is queued, unmounts every mounted reducer, and stops the
    /// dispatcher. Later dispatches are dropped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Job::Unmount(tx)) && lock(&self.inner.rx).is_none() {
            let _ = rx.await;
        }
        self.inner.cancel.cancel();
    }

    fn reduce(&self, action: Arc<dyn Action>, cookie: String, prepare: Option<Prepare>) {
        let _frame = self.inner.profile.push(action.name());
        let mut state = self.state().reset_ephemeral();
        if let Some(prepare) = prepare {
            state = prepare(state);
        }
        let mut mx = Ctx::new(self, state, action, cookie);
        {
            let mut reducers = lock(&self.inner.reducers);
            reducers.append(&mut lock(&self.inner.incoming));
            for slot in reducers.iter_mut() {
                slot.step(&mut mx);
            }
        }
        *lock(&self.inner.state) = mx.state.clone();
        self.broadcast(&mx);
    }

    fn unmount_all(&self) {
        let mut mx = Ctx::new(self, self.state(), Arc::new(Unmount), String::new());
        let mut reducers = lock(&self.inner.reducers);
        for slot in reducers.iter_mut().filter(|s| s.mounted) {
            slot.mounted = false;
            let reducer = &mut slot.reducer;
            shield(&mut mx, &slot.label, "unmount", |mx| reducer.unmount(mx));
        }
    }

    fn broadcast(&self, mx: &Ctx) {
        let listeners: Vec<Arc<Listener>> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(mx))).is_err() {
                log::error!("{} PANIC in subscriber", mx.label());
            }
        }
    }

    /// Registers `listener` for every new state. Listeners run on the
    /// dispatcher in subscription order; the returned closure unsubscribes.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Ctx) + Send + Sync + 'static,
    ) -> impl FnOnce() + Send + 'static {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        let inner = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner.listeners).retain(|(i, _)| *i != id);
            }
        }
    }

    /// The most recently reduced state.
    pub fn state(&self) -> State {
        lock(&self.inner.state).clone()
    }

    pub fn vfs(&self) -> &Vfs {
        &self.inner.vfs
    }

    pub fn profile(&self) -> Arc<Profile> {
        self.inner.profile.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn kv(&self) -> Arc<Memo> {
        self.inner.kv.clone()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
