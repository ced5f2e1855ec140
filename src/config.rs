//! Configuration: a single TOML file, snapshotted copy-on-write.
//!
//! Writers build a new [`Config`] and atomically swap it into a
//! [`SharedConfig`]; readers call [`SharedConfig::load`] once at the start
//! of an operation and keep working from that `Arc` even if a reload
//! happens concurrently. No locks are taken in the hot path.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::error::{Error, Result};

const MIN_STACK_VM_SIZE: u64 = 64 * 1024;
const MAX_STACK_VM_SIZE: u64 = 2 * 1024 * 1024 * 1024;
const MAX_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    pub stack_vm_size: Option<u64>,
    pub warn_timeout_secs: u64,
    pub fail_timeout_secs: u64,
}

impl Default for FiberConfig {
    fn default() -> Self {
        FiberConfig {
            stack_vm_size: None,
            warn_timeout_secs: 15,
            fail_timeout_secs: 300,
        }
    }
}

impl FiberConfig {
    pub fn warn_timeout(&self) -> Duration {
        Duration::from_secs(self.warn_timeout_secs)
    }

    pub fn fail_timeout(&self) -> Duration {
        Duration::from_secs(self.fail_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if let Some(size) = self.stack_vm_size {
            if size % MIN_STACK_VM_SIZE != 0 {
                return Err(Error::Config(format!(
                    "fiber.stack_vm_size ({size}) must be 64 KiB-aligned"
                )));
            }
            if !(MIN_STACK_VM_SIZE..MAX_STACK_VM_SIZE).contains(&size) {
                return Err(Error::Config(format!(
                    "fiber.stack_vm_size ({size}) must be in [64 KiB, 2 GiB)"
                )));
            }
        }
        if self.warn_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(Error::Config("fiber.warn_timeout out of range".into()));
        }
        if self.fail_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(Error::Config("fiber.fail_timeout out of range".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub max_websocket_message_length: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_websocket_message_length: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SslConfig {
    pub server_certificate: Option<PathBuf>,
    pub server_private_key: Option<PathBuf>,
    pub trusted_ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub event_buffer_size: usize,
    pub throttle_size: usize,
    /// Address the WebSocket/HTTP acceptor binds to; `None` disables it
    /// (a headless process driving only fibers/timers/DNS is valid).
    pub listen_address: Option<SocketAddr>,
    pub http: HttpConfig,
    pub ssl: SslConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            event_buffer_size: 256,
            throttle_size: 1 << 20,
            listen_address: None,
            http: HttpConfig::default(),
            ssl: SslConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub fiber: FiberConfig,
    pub network: NetworkConfig,
    pub pid_file: Option<PathBuf>,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("parse error: {e}")))?;
        config.fiber.validate()?;
        if config.network.ssl.trusted_ca_path.is_none() {
            log::warn!("network.ssl.trusted_ca_path not set; peer verification is disabled");
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// A lock-free, copy-on-write handle to the current [`Config`].
pub struct SharedConfig {
    inner: ArcSwap<Config>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        SharedConfig {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// Takes a strong snapshot of the current configuration. The returned
    /// `Arc` is never invalidated by a later [`SharedConfig::store`]; the
    /// caller simply finishes its operation on the snapshot it took.
    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Atomically installs a new configuration. Existing snapshots held by
    /// in-flight operations are unaffected.
    pub fn store(&self, config: Config) {
        self.inner.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.fiber.warn_timeout_secs, 15);
        assert_eq!(config.fiber.fail_timeout_secs, 300);
    }

    #[test]
    fn misaligned_stack_size_rejected() {
        let err = Config::from_toml_str("[fiber]\nstack_vm_size = 100000").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn snapshot_survives_reload() {
        let shared = SharedConfig::new(Config::from_toml_str("").unwrap());
        let snap = shared.load();
        shared.store(Config::from_toml_str("[fiber]\nwarn_timeout_secs = 1").unwrap());
        assert_eq!(snap.fiber.warn_timeout_secs, 15);
        assert_eq!(shared.load().fiber.warn_timeout_secs, 1);
    }
}
