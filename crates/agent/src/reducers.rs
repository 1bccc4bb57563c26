use loupe_goimport::{host_arch, host_os};
use loupe_store::{Ctx, EnvMap, Reducer, Started, State};

/// Reports `ready` once the agent has started.
#[derive(Debug, Default)]
pub struct Ready {
    name: String,
}

impl Ready {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Reducer for Ready {
    fn label(&self) -> String {
        "Ready".to_string()
    }

    fn reduce(&mut self, mx: &Ctx) -> State {
        if !mx.action_is::<Started>() {
            return mx.state.clone();
        }
        log::info!("{}: ready", self.name);
        mx.state.clone().add_status([format!("ready {}", self.name)])
    }
}

const INHERITED: &[&str] = &["GOROOT", "GOPATH"];

/// Fills missing Go variables into the state's environment.
///
/// `GOROOT` and `GOPATH` come from the environment the agent started with;
/// `GOOS` and `GOARCH` default to the host platform.
#[derive(Debug, Default)]
pub struct EnvDefaults {
    base: EnvMap,
}

impl EnvDefaults {
    pub fn new(base: EnvMap) -> Self {
        Self { base }
    }

    fn fill(&self, env: &EnvMap) -> Option<EnvMap> {
        let missing = |k: &str| env.get(k).map_or(true, str::is_empty);
        let mut out = env.clone();
        let mut changed = false;
        for &k in INHERITED {
            if let Some(v) = self.base.get(k).filter(|v| !v.is_empty()) {
                if missing(k) {
                    out.set(k, v);
                    changed = true;
                }
            }
        }
        for (k, v) in [("GOOS", host_os()), ("GOARCH", host_arch())] {
            if missing(k) {
                out.set(k, v);
                changed = true;
            }
        }
        changed.then_some(out)
    }
}

impl Reducer for EnvDefaults {
    fn label(&self) -> String {
        "EnvDefaults".to_string()
    }

    fn reduce(&mut self, mx: &Ctx) -> State {
        match self.fill(mx.env()) {
            Some(env) => mx.state.clone().set_env(env),
            None => mx.state.clone(),
        }
    }
}
