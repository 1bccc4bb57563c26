use crate::error::{AgentError, Result};
use crate::reducers::{EnvDefaults, Ready};
use crate::settings::AgentSettings;
use crate::stream::{lock, Input, Output, SharedWriter};
use loupe_protocol::{AgentRequest, AgentResponse, Codec};
use loupe_store::{
    ActionRegistry, Ctx, EnvMap, Prepare, Profile, Reducer, Shutdown, Started, State, Store,
    StoreConfig, View,
};
use loupe_vfs::Vfs;
use serde::Deserialize;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Everything an [`Agent`] is built from.
///
/// An empty `name` or `codec` falls back to the value in `settings`.
#[derive(Debug)]
pub struct AgentConfig {
    pub name: String,
    pub codec: String,
    pub stdin: Input,
    pub stdout: Output,
    pub stderr: Output,
    /// Environment the agent started with; seeds `State::env`.
    pub env: EnvMap,
    pub settings: AgentSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            codec: String::new(),
            stdin: Input::Stdin,
            stdout: Output::Stdout,
            stderr: Output::Stderr,
            env: EnvMap::new(),
            settings: AgentSettings::default(),
        }
    }
}

/// Editor-maintained properties sent alongside an action.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Props {
    env: Option<EnvMap>,
    view: Option<View>,
}

impl Props {
    fn into_prepare(self) -> Prepare {
        Box::new(move |mut st: State| {
            if let Some(env) = self.env {
                st = st.set_env(env);
            }
            if let Some(mut view) = self.view {
                view.finalize();
                st = st.set_view(view);
            }
            st
        })
    }
}

fn respond(codec: Codec, out: &SharedWriter, cookie: &str, error: &str, state: &State) {
    let resp = AgentResponse {
        cookie,
        error,
        state,
    };
    let mut w = lock(out);
    if let Err(err) = resp.encode(codec, &mut **w) {
        log::error!("cannot encode response #{cookie}: {err}");
    }
}

/// Binds a request stream and a response stream to a [`Store`].
pub struct Agent {
    name: String,
    codec: Codec,
    stdin: Input,
    stdout: Output,
    stderr: Output,
    store: Store,
    registry: Arc<ActionRegistry>,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Result<Self> {
        let AgentConfig {
            name,
            codec,
            stdin,
            stdout,
            stderr,
            env,
            settings,
        } = cfg;
        settings.validate().map_err(AgentError::Settings)?;
        let name = if name.is_empty() { settings.name.clone() } else { name };
        let codec = Codec::from_name(if codec.is_empty() { &settings.codec } else { &codec })?;

        let vfs = match settings.vfs_expiry() {
            Some(ttl) => Vfs::with_expiry(move |now| Some(now + ttl)),
            None => Vfs::with_expiry(|_| None),
        };
        let store = Store::new(StoreConfig {
            state: State::new().set_env(env.clone()),
            vfs,
            profile: Arc::new(Profile::with_enabled(name.clone(), settings.profiling)),
        });
        store.use_reducer(EnvDefaults::new(env));
        store.use_reducer(Ready::new(name.clone()));

        log::debug!("{name}: codec={}", codec.name());
        Ok(Self {
            name,
            codec,
            stdin,
            stdout,
            stderr,
            store,
            registry: Arc::new(ActionRegistry::with_builtins()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn stdin(&self) -> &Input {
        &self.stdin
    }

    pub fn stdout(&self) -> &Output {
        &self.stdout
    }

    pub fn stderr(&self) -> &Output {
        &self.stderr
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Actions the agent can decode. Register custom actions before `run`.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Appends a reducer after the built-in ones.
    pub fn use_reducer(&self, reducer: impl Reducer) -> &Self {
        self.store.use_reducer(reducer);
        self
    }

    /// Serves requests until the input ends or a `Shutdown` arrives.
    ///
    /// Every new state is written to the output as `{Cookie, Error, State}`.
    /// A request that cannot be decoded ends the loop with an error; one
    /// naming an unknown action is answered with an error and skipped.
    pub async fn run(self) -> Result<()> {
        let Agent {
            name,
            codec,
            stdin,
            stdout,
            stderr,
            store,
            registry,
        } = self;

        let out: SharedWriter = Arc::new(Mutex::new(stdout.into_writer()));
        let unsubscribe = store.subscribe({
            let out = out.clone();
            move |mx: &Ctx| respond(codec, &out, &mx.cookie, &mx.state.joined_errors(), &mx.state)
        });

        let handle = store.start()?;
        store.dispatch(Started);
        log::info!("{name}: started");

        let served = {
            let store = store.clone();
            let out = out.clone();
            tokio::task::spawn_blocking(move || serve(codec, stdin, &store, &registry, &out)).await
        };

        store.flush().await;
        store.shutdown().await;
        if let Err(err) = handle.await {
            log::error!("{name}: dispatcher failed: {err}");
        }
        unsubscribe();
        if let Err(err) = lock(&out).flush() {
            log::debug!("{name}: flush: {err}");
        }

        let profile = store.profile();
        if profile.is_enabled() {
            let mut buf = String::new();
            if profile.fprint(&mut buf, "").is_ok() {
                let mut w = stderr.into_writer();
                let _ = w.write_all(buf.as_bytes());
            }
        }

        log::info!("{name}: stopped");
        served.map_err(|e| AgentError::Other(format!("input loop failed: {e}")))?
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("codec", &self.codec)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .finish_non_exhaustive()
    }
}

/// Answers a request that never reached the reducers, once the requests
/// before it have been answered.
fn reply_in_order(codec: Codec, store: &Store, out: &SharedWriter, cookie: String, error: String) {
    let out = out.clone();
    store.run_after(move |st| respond(codec, &out, &cookie, &error, st));
}

fn serve(
    codec: Codec,
    input: Input,
    store: &Store,
    registry: &ActionRegistry,
    out: &SharedWriter,
) -> Result<()> {
    let mut r = input.into_reader();
    loop {
        let Some(req) = AgentRequest::decode(codec, &mut r)? else {
            log::debug!("input closed");
            return Ok(());
        };

        let action = match registry.create(&req.action.name, &req.action.data) {
            Ok(action) => action,
            Err(err) => {
                log::warn!("#{}: {err}", req.cookie);
                reply_in_order(codec, store, out, req.cookie, err.to_string());
                continue;
            }
        };
        let prepare = match req.props.as_ref().map(|p| p.decode::<Props>()).transpose() {
            Ok(props) => props.map(Props::into_prepare),
            Err(err) => {
                let err = format!("cannot decode props: {err}");
                log::warn!("#{}: {err}", req.cookie);
                reply_in_order(codec, store, out, req.cookie, err);
                continue;
            }
        };

        let stop = action.is::<Shutdown>();
        store.dispatch_with(action, req.cookie, prepare);
        if stop {
            log::debug!("shutdown requested");
            return Ok(());
        }
    }
}
