//! Tunables for a [`TunnelRegistry`](crate::TunnelRegistry).
//!
//! Read from a JSON file, with any field optionally overridden from the
//! environment:
//!
//! ```json
//! {
//!   "dial_timeout_ms": 5000,
//!   "relay_buffer_size": 16384,
//!   "default_peer": "i66fo538lfl5ombdf6tcdbrabp4hmp9asv7nrffuc2im13ct4q60"
//! }
//! ```

use std::time::Duration;

pub const ENV_DIAL_TIMEOUT_MS: &str = "P2P_MOUNT_DIAL_TIMEOUT_MS";
pub const ENV_RELAY_BUFFER_SIZE: &str = "P2P_MOUNT_RELAY_BUFFER_SIZE";
pub const ENV_DEFAULT_PEER: &str = "P2P_MOUNT_DEFAULT_PEER";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Bound on opening the overlay stream (listen side) or dialing the
    /// local target (forward side) for one connection.
    pub dial_timeout_ms: u64,
    /// Per-direction copy buffer of a session.
    pub relay_buffer_size: usize,
    /// Inbound streams queued per registered protocol on overlays that take
    /// this setting.
    pub handler_queue: usize,
    /// Peer that `listen` targets when the caller names none.
    pub default_peer: Option<p2p_mount_net::PeerId>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 10_000,
            relay_buffer_size: 8 * 1024,
            handler_queue: p2p_mount_net::DEFAULT_HANDLER_QUEUE,
            default_peer: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl MountConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), ?config, "loaded mount config");
        Ok(config)
    }

    /// Apply `P2P_MOUNT_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DIAL_TIMEOUT_MS) {
            self.dial_timeout_ms = parse_env(ENV_DIAL_TIMEOUT_MS, value)?;
        }
        if let Some(value) = lookup(ENV_RELAY_BUFFER_SIZE) {
            self.relay_buffer_size = parse_env(ENV_RELAY_BUFFER_SIZE, value)?;
        }
        if let Some(value) = lookup(ENV_DEFAULT_PEER) {
            self.default_peer = if value.is_empty() {
                None
            } else {
                Some(parse_env(ENV_DEFAULT_PEER, value)?)
            };
        }
        Ok(self)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Copy buffer size, never zero.
    pub fn relay_buffer_size(&self) -> usize {
        self.relay_buffer_size.max(1)
    }
}

fn parse_env<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse() {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::Env {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
