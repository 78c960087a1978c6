use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::{MemoryTierConfig, SessionTierConfig, TieredCacheConfig, validate_tier_order};
use crate::core::{CacheError, EvictionStrategy, Result, TierKind};
use crate::metrics::MetricsConfig;

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: Server,
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 15600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Configuration of one cache instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory: MemoryConfig,
    pub session: SessionConfig,
    pub remote: RemoteConfig,
    pub tiered: TieredConfig,
    pub dedup: DedupConfig,
    pub memoize: MemoizeConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub default_ttl_secs: u64,
    pub eviction_strategy: EvictionStrategy,
    pub cleanup_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_memory_bytes: 100 * 1024 * 1024,
            default_ttl_secs: 3600,
            eviction_strategy: EvictionStrategy::Lru,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub item_ttl_secs: u64,
    pub max_session_size: usize,
    pub max_total_size: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            item_ttl_secs: 1800,
            max_session_size: 100,
            max_total_size: 10_000,
            cleanup_interval_secs: 60,
        }
    }
}

/// Which store backs a remote tier slot
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    #[default]
    None,
    /// In-process [`crate::cache::LocalStore`]
    Local,
}

impl FromStr for RemoteBackend {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "local" => Ok(Self::Local),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown remote backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub primary: RemoteBackend,
    pub secondary: RemoteBackend,
    pub ttl_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            primary: RemoteBackend::None,
            secondary: RemoteBackend::None,
            ttl_secs: 3600,
            health_check_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredConfig {
    pub tier_order: Vec<TierKind>,
    pub write_through: bool,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            tier_order: TierKind::ALL.to_vec(),
            write_through: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { window_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoizeConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for MemoizeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 100,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| CacheError::InvalidConfig(format!("{}: cannot parse '{}'", name, raw)))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CacheError::InvalidConfig(format!(
            "{}: expected a boolean, got '{}'",
            name, raw
        ))),
    }
}

impl CacheConfig {
    /// Defaults overlaid with `STRATA_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay settings from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! env_override {
            ($name:literal => $target:expr) => {
                if let Some(raw) = lookup($name) {
                    $target = parse_env($name, &raw)?;
                }
            };
        }

        env_override!("STRATA_MEMORY_MAX_ENTRIES" => self.memory.max_entries);
        env_override!("STRATA_MEMORY_LIMIT_BYTES" => self.memory.max_memory_bytes);
        env_override!("STRATA_DEFAULT_TTL" => self.memory.default_ttl_secs);
        env_override!("STRATA_REMOTE_TTL" => self.remote.ttl_secs);
        env_override!("STRATA_SESSION_TTL" => self.session.ttl_secs);
        env_override!("STRATA_SESSION_ITEM_TTL" => self.session.item_ttl_secs);
        env_override!("STRATA_MAX_SESSION_SIZE" => self.session.max_session_size);
        env_override!("STRATA_MAX_TOTAL_SESSION_ITEMS" => self.session.max_total_size);
        env_override!("STRATA_HEALTH_CHECK_INTERVAL" => self.remote.health_check_interval_secs);
        env_override!("STRATA_REMOTE_PRIMARY" => self.remote.primary);
        env_override!("STRATA_REMOTE_SECONDARY" => self.remote.secondary);

        if let Some(raw) = lookup("STRATA_WRITE_THROUGH") {
            self.tiered.write_through = parse_bool("STRATA_WRITE_THROUGH", &raw)?;
        }
        Ok(())
    }

    /// Reject settings the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("memory.max_entries", self.memory.max_entries as u64),
            ("memory.max_memory_bytes", self.memory.max_memory_bytes as u64),
            ("memory.default_ttl_secs", self.memory.default_ttl_secs),
            ("session.ttl_secs", self.session.ttl_secs),
            ("session.item_ttl_secs", self.session.item_ttl_secs),
            ("session.max_session_size", self.session.max_session_size as u64),
            ("session.max_total_size", self.session.max_total_size as u64),
            ("remote.ttl_secs", self.remote.ttl_secs),
            ("remote.health_check_interval_secs", self.remote.health_check_interval_secs),
            ("memoize.max_entries", self.memoize.max_entries as u64),
            ("metrics.sample_size", self.metrics.sample_size as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(CacheError::InvalidConfig(format!("{} must be positive", name)));
        }

        if self.session.max_session_size > self.session.max_total_size {
            return Err(CacheError::InvalidConfig(
                "session.max_session_size exceeds session.max_total_size".to_string(),
            ));
        }
        if self.metrics.degraded_error_threshold > self.metrics.unhealthy_error_threshold {
            return Err(CacheError::InvalidConfig(
                "metrics.degraded_error_threshold exceeds metrics.unhealthy_error_threshold"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.metrics.low_hit_rate)
            || !(0.0..=1.0).contains(&self.metrics.memory_utilization_threshold)
        {
            return Err(CacheError::InvalidConfig(
                "metrics ratios must lie within 0..=1".to_string(),
            ));
        }

        validate_tier_order(&self.tiered.tier_order)
    }

    pub fn memory_tier_config(&self) -> MemoryTierConfig {
        MemoryTierConfig {
            max_entries: self.memory.max_entries,
            max_memory_bytes: self.memory.max_memory_bytes,
            default_ttl: Duration::from_secs(self.memory.default_ttl_secs),
            strategy: self.memory.eviction_strategy,
        }
    }

    pub fn session_tier_config(&self) -> SessionTierConfig {
        SessionTierConfig {
            session_ttl: Duration::from_secs(self.session.ttl_secs),
            item_ttl: Duration::from_secs(self.session.item_ttl_secs),
            max_session_size: self.session.max_session_size,
            max_total_size: self.session.max_total_size,
        }
    }

    pub fn tiered_config(&self) -> TieredCacheConfig {
        TieredCacheConfig {
            memory: self.memory_tier_config(),
            session: self.session_tier_config(),
            tier_order: self.tiered.tier_order.clone(),
            write_through: self.tiered.write_through,
            remote_ttl: Duration::from_secs(self.remote.ttl_secs),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay `STRATA_*` variables, including the server and logging ones
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("STRATA_HOST") {
            self.server.host = host;
        }
        if let Some(raw) = lookup("STRATA_PORT") {
            self.server.port = parse_env("STRATA_PORT", &raw)?;
        }
        if let Some(level) = lookup("STRATA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("STRATA_LOG_FORMAT") {
            self.logging.format = format;
        }
        self.cache.apply_env(lookup)
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.memory.max_entries, 1000);
        assert_eq!(config.memory.default_ttl_secs, 3600);
        assert_eq!(config.memory.max_memory_bytes, 104_857_600);
        assert_eq!(config.remote.ttl_secs, 3600);
        assert_eq!(config.session.ttl_secs, 3600);
        assert_eq!(config.session.item_ttl_secs, 1800);
        assert_eq!(config.session.max_session_size, 100);
        assert_eq!(config.session.max_total_size, 10_000);
        assert!(!config.tiered.write_through);
        assert_eq!(config.remote.health_check_interval_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CacheConfig::default();
        config
            .apply_env(lookup_from(&[
                ("STRATA_MEMORY_MAX_ENTRIES", "50"),
                ("STRATA_WRITE_THROUGH", "true"),
                ("STRATA_SESSION_ITEM_TTL", "60"),
                ("STRATA_REMOTE_PRIMARY", "local"),
            ]))
            .unwrap();

        assert_eq!(config.memory.max_entries, 50);
        assert!(config.tiered.write_through);
        assert_eq!(config.session.item_ttl_secs, 60);
        assert_eq!(config.remote.primary, RemoteBackend::Local);
    }

    #[test]
    fn test_env_parse_error() {
        let mut config = CacheConfig::default();
        let err = config
            .apply_env(lookup_from(&[("STRATA_DEFAULT_TTL", "soon")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfig(_)));

        let err = config
            .apply_env(lookup_from(&[("STRATA_WRITE_THROUGH", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("STRATA_WRITE_THROUGH"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CacheConfig::default();
        config.memory.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.session.max_session_size = 20_000;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.tiered.tier_order = vec![TierKind::Session];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  host: 127.0.0.1
  port: 16000
logging:
  level: debug
  format: plain
cache:
  memory:
    max_entries: 10
    eviction_strategy: lfu
  remote:
    primary: local
  tiered:
    tier_order: [memory, remote_primary]
    write_through: true
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:16000");
        assert_eq!(config.logging.format, "plain");
        assert_eq!(config.cache.memory.max_entries, 10);
        assert_eq!(config.cache.memory.eviction_strategy, EvictionStrategy::Lfu);
        assert_eq!(config.cache.memory.default_ttl_secs, 3600);
        assert_eq!(config.cache.remote.primary, RemoteBackend::Local);
        assert_eq!(
            config.cache.tiered.tier_order,
            vec![TierKind::Memory, TierKind::RemotePrimary]
        );
        assert!(config.cache.validate().is_ok());
    }

    #[test]
    fn test_server_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env(lookup_from(&[("STRATA_PORT", "9000"), ("STRATA_LOG_LEVEL", "warn")]))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_tiered_config_conversion() {
        let mut config = CacheConfig::default();
        config.remote.ttl_secs = 42;
        let tiered = config.tiered_config();
        assert_eq!(tiered.remote_ttl, Duration::from_secs(42));
        assert_eq!(tiered.memory.max_entries, 1000);
        assert_eq!(tiered.session.item_ttl, Duration::from_secs(1800));
    }
}
