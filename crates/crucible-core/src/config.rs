//! Configuration system for Crucible.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CRUCIBLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/crucible/config.toml
//!   3. ~/.config/crucible/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::Network;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrucibleConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub worker: WorkerConfig,
    pub deploy: DeploySettings,
}

/// Queue + bus endpoint (one Redis instance serves both).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Empty = no auth.
    pub password: String,
    pub db: i64,
}

impl BrokerConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

/// Job store endpoint — path to the SQLite database of record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub uri: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    /// CORS allow-list, fixed at boot. Empty = allow any origin.
    pub cors_origins: Vec<String>,
}

/// Which queue a worker instance consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Compile,
    Deploy,
}

impl std::str::FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(WorkerType::Compile),
            "deploy" => Ok(WorkerType::Deploy),
            other => Err(format!("unknown worker type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_type: WorkerType,
    /// Max in-flight compile payloads on one instance.
    pub compile_concurrency: u32,
    /// Max in-flight deploy payloads on one instance.
    pub deploy_concurrency: u32,
    /// Root for per-job ephemeral build directories.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    pub network: Network,
    pub horizon_url: String,
    /// Name of the process-wide default signing identity.
    pub identity_name: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            api: ApiConfig::default(),
            worker: WorkerConfig::default(),
            deploy: DeploySettings::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: data_dir().join("crucible.db"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8743,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_type: WorkerType::Compile,
            compile_concurrency: 2,
            deploy_concurrency: 2,
            work_dir: PathBuf::from("/tmp/crucible-work"),
        }
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            horizon_url: "https://horizon-testnet.stellar.org".to_string(),
            identity_name: "crucible-deployer".to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("crucible")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("crucible")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CrucibleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CrucibleConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CRUCIBLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CrucibleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply env var overrides. Names are the operational surface, so
    /// they are not prefixed.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BROKER_HOST") {
            self.broker.host = v;
        }
        if let Ok(v) = std::env::var("BROKER_PORT") {
            if let Ok(p) = v.parse() {
                self.broker.port = p;
            }
        }
        if let Ok(v) = std::env::var("BROKER_PASSWORD") {
            self.broker.password = v;
        }
        if let Ok(v) = std::env::var("BROKER_DB") {
            if let Ok(db) = v.parse() {
                self.broker.db = db;
            }
        }
        if let Ok(v) = std::env::var("STORE_URI") {
            self.store.uri = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COMPILE_WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.worker.compile_concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("DEPLOY_WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.worker.deploy_concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("WORKER_TYPE") {
            if let Ok(t) = v.parse() {
                self.worker.worker_type = t;
            }
        }
        if let Ok(v) = std::env::var("PAYMENT_NETWORK") {
            if let Ok(n) = v.parse() {
                self.deploy.network = n;
            }
        }
        if let Ok(v) = std::env::var("HORIZON_URL") {
            self.deploy.horizon_url = v;
        }
        if let Ok(v) = std::env::var("API_PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
        if let Ok(v) = std::env::var("CORS_ORIGINS") {
            self.api.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = CrucibleConfig::default();
        assert_eq!(config.broker.port, 6379);
        assert_eq!(config.worker.compile_concurrency, 2);
        assert_eq!(config.worker.deploy_concurrency, 2);
        assert_eq!(config.deploy.network, Network::Testnet);
    }

    #[test]
    fn broker_url_with_and_without_password() {
        let mut broker = BrokerConfig::default();
        assert_eq!(broker.url(), "redis://127.0.0.1:6379/0");
        broker.password = "hunter2".into();
        broker.db = 3;
        assert_eq!(broker.url(), "redis://:hunter2@127.0.0.1:6379/3");
    }

    #[test]
    fn worker_type_parses() {
        assert_eq!("compile".parse::<WorkerType>().unwrap(), WorkerType::Compile);
        assert_eq!("deploy".parse::<WorkerType>().unwrap(), WorkerType::Deploy);
        assert!("both".parse::<WorkerType>().is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = CrucibleConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: CrucibleConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.broker.host, config.broker.host);
        assert_eq!(back.deploy.identity_name, config.deploy.identity_name);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("crucible-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("CRUCIBLE_CONFIG", config_path.to_str().unwrap());
        }

        let path = CrucibleConfig::write_default_if_missing().expect("write failed");
        assert!(path.exists());

        let config = CrucibleConfig::load().expect("load should succeed");
        assert_eq!(config.broker.port, 6379);

        unsafe {
            std::env::remove_var("CRUCIBLE_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
