// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/been.toml";

pub const ENV_CONFIG_PATH: &str = "BEEN_CONFIG_PATH";
pub const ENV_STORE: &str = "BEEN_STORE";
pub const ENV_COUCHDB_URL: &str = "COUCHDB_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";

fn default_store() -> String {
    "couch".to_string()
}
fn default_couch_url() -> String {
    "http://127.0.0.1:5984".to_string()
}
fn default_db_name() -> String {
    "activity".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_prefix() -> String {
    "activity-".to_string()
}
fn default_user_agent() -> String {
    concat!("been/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_update_interval_secs() -> u64 {
    15 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// "couch" | "redis" | "memory"
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default)]
    pub couch: CouchConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchConfig {
    #[serde(default = "default_couch_url")]
    pub url: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prepended to every key.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            couch: CouchConfig::default(),
            redis: RedisConfig::default(),
            feed: FeedConfig::default(),
            serve: ServeConfig::default(),
        }
    }
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            url: default_couch_url(),
            db_name: default_db_name(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            prefix: default_prefix(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            update_interval_secs: default_update_interval_secs(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit TOML file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg = Self::from_toml_str(&content)
            .with_context(|| format!("parsing config at {}", path.display()))?;
        Ok(cfg.with_env_overrides())
    }

    /// Resolve the config file:
    /// 1) $BEEN_CONFIG_PATH (must exist)
    /// 2) config/been.toml
    /// 3) built-in defaults
    ///
    /// Env overrides apply in every case.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        Ok(Self::default().with_env_overrides())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(v) = non_empty_env(ENV_STORE) {
            self.store = v;
        }
        if let Some(v) = non_empty_env(ENV_COUCHDB_URL) {
            self.couch.url = v;
        }
        if let Some(v) = non_empty_env(ENV_REDIS_URL) {
            self.redis.url = v;
        }
        self.store = self.store.trim().to_ascii_lowercase();
        self
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
store = "redis"

[redis]
prefix = "me-"
"#,
        )
        .unwrap();
        assert_eq!(cfg.store, "redis");
        assert_eq!(cfg.redis.prefix, "me-");
        assert_eq!(cfg.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.couch.db_name, "activity");
        assert_eq!(cfg.serve.update_interval_secs, 900);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var(ENV_STORE);

        // No file at all: built-in defaults.
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.store, "couch");

        // Env path wins, and BEEN_STORE overrides the file.
        let p = tmp.path().join("custom.toml");
        fs::write(&p, "store = \"redis\"\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        assert_eq!(AppConfig::load_default().unwrap().store, "redis");
        env::set_var(ENV_STORE, " Memory ");
        assert_eq!(AppConfig::load_default().unwrap().store, "memory");

        env::remove_var(ENV_STORE);
        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(AppConfig::load_default().is_err());
        env::remove_var(ENV_CONFIG_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
