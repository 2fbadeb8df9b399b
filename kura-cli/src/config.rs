//! Server configuration file.
//!
//! ```yaml
//! address: 127.0.0.1:9091
//! database:
//!   type: sqlite
//!   connection: ./kura.db
//! schemas:
//!   - ./schema.yaml
//! extension:
//!   timelimit_ms: 30000
//!   timelimits:
//!     - event: "^pre_"
//!       timelimit_ms: 1000
//! config:
//!   keystone:
//!     use: false
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use kura_extension::{FsCap, NetCap, TimeLimits};
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9091";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub address: String,
    pub database: DatabaseConfig,
    pub schemas: Vec<PathBuf>,
    pub extension: ExtensionConfig,
    /// Exposed to scripts through `config(key, default)`.
    pub config: Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            database: DatabaseConfig::default(),
            schemas: Vec::new(),
            extension: ExtensionConfig::default(),
            config: Value::Object(Default::default()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub connection: String,
    pub max_open_conn: u32,
    pub drop_on_create: bool,
    pub cascade: bool,
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            connection: "./kura.db".to_string(),
            max_open_conn: 100,
            drop_on_create: false,
            cascade: false,
            auto_migrate: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventLimit {
    pub event: String,
    pub timelimit_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub timelimit_ms: u64,
    pub timelimits: Vec<EventLimit>,
    pub fs_root: Option<PathBuf>,
    pub allowed_hosts: Option<Vec<String>>,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            timelimit_ms: 30_000,
            timelimits: Vec::new(),
            fs_root: None,
            allowed_hosts: None,
        }
    }
}

impl ExtensionConfig {
    pub fn limits(&self) -> anyhow::Result<TimeLimits> {
        let mut limits = TimeLimits::new(Duration::from_millis(self.timelimit_ms));
        for limit in &self.timelimits {
            limits = limits.with_override(&limit.event, Duration::from_millis(limit.timelimit_ms))?;
        }
        Ok(limits)
    }

    pub fn net(&self) -> NetCap {
        match &self.allowed_hosts {
            Some(hosts) => NetCap::AllowDomains(hosts.clone()),
            None => NetCap::Open,
        }
    }

    pub fn fs(&self) -> anyhow::Result<Option<FsCap>> {
        self.fs_root.as_ref().map(FsCap::open).transpose().map_err(Into::into)
    }
}

impl Config {
    /// Parses `text`; relative paths are resolved against `base`.
    pub fn from_yaml(text: &str, base: &Path) -> anyhow::Result<Self> {
        let mut config: Config = serde_yaml::from_str(text)?;
        config.schemas = config.schemas.into_iter().map(|p| base.join(p)).collect();
        config.extension.fs_root = config.extension.fs_root.map(|p| base.join(p));
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&text, base).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn address(&self) -> anyhow::Result<SocketAddr> {
        self.address
            .parse()
            .with_context(|| format!("invalid address {}", self.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_yaml("schemas: [schema.yaml]\n", Path::new("/etc/kura")).unwrap();
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(config.database.kind, "sqlite");
        assert_eq!(config.database.max_open_conn, 100);
        assert_eq!(config.extension.timelimit_ms, 30_000);
        assert_eq!(config.schemas, vec![PathBuf::from("/etc/kura/schema.yaml")]);
        assert!(config.config.as_object().is_some_and(|m| m.is_empty()));
    }

    #[test]
    fn event_limits_override_default() {
        let text = r#"
extension:
  timelimit_ms: 500
  timelimits:
    - event: "^pre_"
      timelimit_ms: 20
  allowed_hosts: [example.com]
config:
  keystone:
    use: true
"#;
        let config = Config::from_yaml(text, Path::new(".")).unwrap();
        let limits = config.extension.limits().unwrap();
        assert_eq!(limits.limit_for("pre_create"), Duration::from_millis(20));
        assert_eq!(limits.limit_for("post_create"), Duration::from_millis(500));
        assert!(config.extension.net().allows("example.com"));
        assert!(!config.extension.net().allows("other.org"));
        assert_eq!(config.config["keystone"]["use"], Value::Bool(true));
    }

    #[test]
    fn bad_address_is_reported() {
        let config = Config::from_yaml("address: nowhere\n", Path::new(".")).unwrap();
        assert!(config.address().is_err());
    }
}
