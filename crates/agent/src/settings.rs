use crate::error::{AgentError, Result};
use loupe_protocol::Codec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Agent settings, usually read from a TOML file.
///
/// ```toml
/// codec = "cbor"
/// vfs_expiry_secs = 30
/// import_concurrency = 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Wire codec: `json`, `cbor` or `msgpack`
    pub codec: String,

    /// Agent name, used for logs and the profile root
    pub name: String,

    /// How long a cached stat stays fresh; 0 means it never expires
    pub vfs_expiry_secs: u64,

    /// Dependency import workers per package (0 = number of CPUs)
    pub import_concurrency: usize,

    /// Record reduction timings
    pub profiling: bool,

    /// Concurrent calls served by the legacy broker
    pub legacy_workers: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            codec: Codec::default().name().to_string(),
            name: "loupe".to_string(),
            vfs_expiry_secs: 17,
            import_concurrency: 0,
            profiling: false,
            legacy_workers: 20,
        }
    }
}

impl AgentSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw).map_err(|e| AgentError::Settings(e.to_string()))?;
        settings.validate().map_err(AgentError::Settings)?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Err(err) = Codec::from_name(&self.codec) {
            return Err(err.to_string());
        }

        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }

        if self.legacy_workers == 0 {
            return Err("legacy_workers must be > 0".to_string());
        }

        Ok(())
    }

    pub fn vfs_expiry(&self) -> Option<Duration> {
        (self.vfs_expiry_secs > 0).then(|| Duration::from_secs(self.vfs_expiry_secs))
    }
}
