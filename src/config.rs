use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SupervisorError, SupervisorResult};

/// Default SSH port used when a [`HostConfig`] doesn't specify one.
fn default_ssh_port() -> u16 {
    22
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

/// Credentials for authenticating to a [`HostConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

/// One side of a tunnel (source or endpoint). `port` carries whichever
/// port is meaningful for that side: `forwardedPort` on the source,
/// `boundPort` on the endpoint (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub user: String,
    pub auth: SshAuth,
    pub port: u16,
}

/// Bounded, linear retry policy for one tunnel (spec §3, §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval_ms: u64,
}

impl RetryPolicy {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Immutable per-connect tunnel configuration. `name` is the identity key
/// used throughout the supervisor (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub name: String,
    pub source: HostConfig,
    pub endpoint: HostConfig,
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl TunnelConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Validate the configuration before it's accepted by the supervisor.
    pub fn validate(&self) -> SupervisorResult<()> {
        if self.name.is_empty() {
            return Err(SupervisorError::Config("Tunnel name cannot be empty".to_string()));
        }
        if self.source.host.is_empty() {
            return Err(SupervisorError::Config("Source host cannot be empty".to_string()));
        }
        if self.endpoint.host.is_empty() {
            return Err(SupervisorError::Config("Endpoint host cannot be empty".to_string()));
        }
        if self.source.user.is_empty() || self.endpoint.user.is_empty() {
            return Err(SupervisorError::Config(
                "Source and endpoint users cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a list of tunnel configs from a JSON file (used by the `serve`
    /// subcommand to pre-seed the in-memory config store).
    pub fn load_file<P: AsRef<Path>>(path: P) -> SupervisorResult<Vec<TunnelConfig>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SupervisorError::Config(format!("Failed to read config file: {e}")))?;

        let configs: Vec<TunnelConfig> = serde_json::from_str(&content)
            .map_err(|e| SupervisorError::Config(format!("Failed to parse config: {e}")))?;

        for config in &configs {
            config.validate()?;
        }

        Ok(configs)
    }
}

/// Collaborator the supervisor asks for a [`TunnelConfig`] when only a
/// `name` is known (e.g. when a retry timer fires). Persistence of the
/// backing store is explicitly out of scope (spec §1) — this crate ships
/// only the trivial in-memory implementation needed to exercise that path.
pub trait TunnelConfigStore: Send + Sync {
    fn get(&self, name: &str) -> Option<TunnelConfig>;
    fn put(&self, config: TunnelConfig);
    fn remove(&self, name: &str);
}

/// In-memory [`TunnelConfigStore`]. Updated synchronously before any task
/// that might read the new entry is spawned (spec §5).
#[derive(Default)]
pub struct InMemoryConfigStore {
    configs: RwLock<HashMap<String, TunnelConfig>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(configs: Vec<TunnelConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.put(config);
        }
        store
    }
}

impl TunnelConfigStore for InMemoryConfigStore {
    fn get(&self, name: &str) -> Option<TunnelConfig> {
        self.configs.read().expect("config store lock poisoned").get(name).cloned()
    }

    fn put(&self, config: TunnelConfig) {
        self.configs
            .write()
            .expect("config store lock poisoned")
            .insert(config.name.clone(), config);
    }

    fn remove(&self, name: &str) {
        self.configs.write().expect("config store lock poisoned").remove(name);
    }
}

/// Process-wide settings layered from a config file and environment
/// variables via the `config` crate (bind address, interval overrides, log
/// filter) — distinct from per-tunnel [`TunnelConfig`], which arrives over
/// the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_liveness_interval_secs() -> u64 {
    30
}

fn default_log_filter() -> String {
    "tunnelsup=info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            liveness_interval_secs: default_liveness_interval_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl ServerSettings {
    /// Load settings from an optional file, layered with `TUNNELSUP_*`
    /// environment variable overrides (e.g. `TUNNELSUP_BIND_ADDR`).
    pub fn load(file: Option<&Path>) -> SupervisorResult<Self> {
        let mut builder = config::Config::builder()
            .set_default("bind_addr", default_bind_addr())
            .map_err(|e| SupervisorError::Config(e.to_string()))?
            .set_default("liveness_interval_secs", default_liveness_interval_secs() as i64)
            .map_err(|e| SupervisorError::Config(e.to_string()))?
            .set_default("log_filter", default_log_filter())
            .map_err(|e| SupervisorError::Config(e.to_string()))?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("TUNNELSUP"))
            .build()
            .map_err(|e| SupervisorError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| SupervisorError::Config(format!("Failed to parse server settings: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> TunnelConfig {
        TunnelConfig {
            name: "t1".to_string(),
            source: HostConfig {
                host: "source.example.com".to_string(),
                ssh_port: 22,
                user: "alice".to_string(),
                auth: SshAuth::Password("hunter2".to_string()),
                port: 8080,
            },
            endpoint: HostConfig {
                host: "endpoint.example.com".to_string(),
                ssh_port: 22,
                user: "bob".to_string(),
                auth: SshAuth::PrivateKey {
                    path: "/home/bob/.ssh/id_ed25519".to_string(),
                    passphrase: None,
                },
                port: 9090,
            },
            retry_policy: RetryPolicy {
                max_retries: 3,
                retry_interval_ms: 5000,
            },
            refresh_interval_ms: 30_000,
        }
    }

    #[test]
    fn validates_a_well_formed_config() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        let mut config = sample_config();
        config.name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_host() {
        let mut config = sample_config();
        config.source.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json_file() {
        let configs = vec![sample_config()];
        let mut temp_file = std::env::temp_dir();
        temp_file.push("tunnelsup_test_config.json");

        std::fs::write(&temp_file, serde_json::to_string_pretty(&configs).unwrap()).unwrap();

        let loaded = TunnelConfig::load_file(&temp_file).unwrap();
        let _ = std::fs::remove_file(&temp_file);

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "t1");
        assert_eq!(loaded[0].endpoint.port, 9090);
    }

    #[test]
    fn in_memory_store_roundtrips() {
        let store = InMemoryConfigStore::new();
        let config = sample_config();
        store.put(config.clone());

        let fetched = store.get("t1").expect("config should be present");
        assert_eq!(fetched.source.host, config.source.host);

        store.remove("t1");
        assert!(store.get("t1").is_none());
    }

    #[test]
    fn server_settings_default_when_no_file() {
        let settings = ServerSettings::load(None).unwrap();
        assert_eq!(settings.bind_addr, "127.0.0.1:8787");
        assert_eq!(settings.liveness_interval_secs, 30);
    }
}
