//! The line-oriented method-call broker.
//!
//! Each request line names a method and a token; calls run on a bounded
//! worker pool and are answered, in completion order, with a response
//! carrying the same token.

use crate::error::{AgentError, Result};
use crate::stream::{lock, Input, Output, SharedWriter};
use loupe_goimport::{host_arch, host_os};
use loupe_protocol::legacy::{parse_line, LegacyResponse, BYE_METHOD, BYE_TOKEN, HELLO_TOKEN};
use loupe_store::{fmt_duration, EnvMap};
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// A method body: payload in, data or an error message out.
pub type Method = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Name → method map served by a [`Broker`].
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Method>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `hello` echoes its payload; `env` looks up the variables in `List`.
    pub fn with_builtins(env: EnvMap) -> Self {
        let reg = Self::new();
        let _ = reg.register("hello", |payload| Ok(payload));
        let _ = reg.register("env", move |payload| env_method(&env, payload));
        reg
    }

    pub fn register(
        &self,
        name: &str,
        method: impl Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(AgentError::Other("method name must not be empty".to_string()));
        }
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        if methods.contains_key(name) {
            return Err(AgentError::Other(format!("method {name} is already registered")));
        }
        methods.insert(name.to_string(), Arc::new(method));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Method> {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnvArgs {
    #[serde(rename = "List", default)]
    list: Vec<String>,
}

fn env_method(env: &EnvMap, payload: Value) -> std::result::Result<Value, String> {
    let args: EnvArgs = if payload.is_null() {
        EnvArgs::default()
    } else {
        serde_json::from_value(payload).map_err(|e| e.to_string())?
    };
    let vars: BTreeMap<String, String> = args
        .list
        .into_iter()
        .map(|k| {
            let v = match (env.get(&k).filter(|v| !v.is_empty()), k.as_str()) {
                (Some(v), _) => v.to_string(),
                (None, "GOOS") => host_os().to_string(),
                (None, "GOARCH") => host_arch().to_string(),
                (None, _) => String::new(),
            };
            (k, v)
        })
        .collect();
    serde_json::to_value(vars).map_err(|e| e.to_string())
}

/// Totals reported in the `bye-ni` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub served: u64,
    pub uptime: Duration,
}

pub struct Broker {
    tag: String,
    registry: Arc<MethodRegistry>,
    workers: usize,
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

fn send(out: &SharedWriter, resp: LegacyResponse) {
    let line = match resp.to_line() {
        Ok(line) => line,
        Err(err) => {
            log::error!("broker: cannot encode response {}: {err}", resp.token);
            return;
        }
    };
    let mut w = lock(out);
    if let Err(err) = w.write_all(line.as_bytes()).and_then(|_| w.flush()) {
        log::error!("broker: cannot send response {}: {err}", resp.token);
    }
}

fn read_lines(input: Input, tx: mpsc::Sender<io::Result<String>>) {
    let mut r = input.into_reader();
    loop {
        let mut line = String::new();
        match r.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                if tx.blocking_send(Ok(line)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        }
    }
}

impl Broker {
    pub fn new(tag: impl Into<String>, registry: Arc<MethodRegistry>, workers: usize) -> Self {
        Self {
            tag: tag.into(),
            registry,
            workers: workers.max(1),
        }
    }

    /// Serves calls until the input ends or a `bye-ni` request arrives,
    /// then waits for in-flight calls and writes the closing frame.
    pub async fn serve(&self, input: Input, output: Output) -> Result<BrokerStats> {
        let start = Instant::now();
        let out: SharedWriter = Arc::new(Mutex::new(output.into_writer()));
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        send(
            &out,
            LegacyResponse::new(HELLO_TOKEN, &self.tag).with_data(json!({ "time": since_epoch })),
        );

        let (tx, mut rx) = mpsc::channel(self.workers);
        tokio::task::spawn_blocking(move || read_lines(input, tx));

        let pool = Arc::new(Semaphore::new(self.workers));
        let mut calls = JoinSet::new();
        let mut served = 0u64;
        while let Some(line) = rx.recv().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    log::error!("broker: cannot read input: {err}");
                    send(&out, LegacyResponse::new("", &self.tag).with_error(err.to_string()));
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let (req, payload) = match parse_line(&line) {
                Ok(v) => v,
                Err(err) => {
                    log::warn!("broker: cannot decode request: {err}");
                    send(&out, LegacyResponse::new("", &self.tag).with_error(err.to_string()));
                    continue;
                }
            };
            if req.method.is_empty() {
                continue;
            }
            if req.method == BYE_METHOD {
                break;
            }
            let Some(method) = self.registry.lookup(&req.method) else {
                let err = format!("Invalid method {}", req.method);
                log::warn!("broker: {err}");
                send(&out, LegacyResponse::new(req.token, &self.tag).with_error(err));
                continue;
            };

            let permit = pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AgentError::Other(e.to_string()))?;
            served += 1;
            let out = out.clone();
            let tag = self.tag.clone();
            calls.spawn_blocking(move || {
                let _permit = permit;
                let resp = LegacyResponse::new(req.token.clone(), tag);
                let resp = match catch_unwind(AssertUnwindSafe(|| method(payload))) {
                    Ok(Ok(data)) => resp.with_data(data),
                    Ok(Err(err)) => resp.with_error(err),
                    Err(panic) => {
                        log::error!(
                            "broker: {}#{} PANIC: {}",
                            req.method,
                            req.token,
                            panic_message(panic.as_ref())
                        );
                        resp.with_error(format!("broker: {}#{} PANIC", req.method, req.token))
                    }
                };
                send(&out, resp);
            });
        }
        drop(rx);

        while let Some(res) = calls.join_next().await {
            if let Err(err) = res {
                log::error!("broker: call failed: {err}");
            }
        }

        let stats = BrokerStats {
            served,
            uptime: start.elapsed(),
        };
        send(
            &out,
            LegacyResponse::new(BYE_TOKEN, &self.tag).with_data(json!({
                "served": stats.served,
                "uptime": fmt_duration(stats.uptime),
            })),
        );
        Ok(stats)
    }
}
