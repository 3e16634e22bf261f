//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via NETCONFD_CONFIG)
//! 3. Environment variables

use netconf_protocol::framing::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Features of the standard capability catalog.
pub const STANDARD_FEATURES: &[&str] = &[
    "writable-running",
    "candidate",
    "validate",
    "xpath",
    "notification",
    "interleave",
];

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Capability configuration.
    pub capabilities: CapabilitiesConfig,
    /// Chunked framing configuration.
    pub framing: FramingConfig,
    /// Notification stream configuration.
    pub notifications: NotificationsConfig,
    /// In-memory datastore configuration.
    pub datastore: DatastoreConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("NETCONFD_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.capabilities.apply_env_overrides();
        self.framing.apply_env_overrides();
        self.notifications.apply_env_overrides();
        self.datastore.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that cannot be expressed by the types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.framing.max_chunk_size == 0 || self.framing.max_chunk_size as u64 > u32::MAX as u64 {
            return Err(ConfigError::ValidationError(format!(
                "framing.max_chunk_size must be in 1..={}",
                u32::MAX
            )));
        }
        for feature in &self.capabilities.features {
            if !STANDARD_FEATURES.contains(&feature.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "unknown feature '{}'",
                    feature
                )));
            }
        }
        for stream in &self.notifications.streams {
            if stream.name.is_empty() {
                return Err(ConfigError::ValidationError("stream without a name".to_string()));
            }
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], netconf_protocol::DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("NETCONFD_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("NETCONFD_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Capability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    /// Enabled features; capabilities gated on other features are not
    /// advertised.
    pub features: Vec<String>,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            features: STANDARD_FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl CapabilitiesConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(features) = std::env::var("NETCONFD_FEATURES") {
            self.features = features
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
        }
    }
}

/// Chunked framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Largest chunk the server sends.
    pub max_chunk_size: usize,
    /// Send chunks of random size up to `max_chunk_size`.
    pub randomize_chunks: bool,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            randomize_chunks: false,
        }
    }
}

impl FramingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("NETCONFD_MAX_CHUNK_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_chunk_size = n;
            }
        }

        if let Ok(randomize) = std::env::var("NETCONFD_RANDOMIZE_CHUNKS") {
            self.randomize_chunks = env_flag(&randomize);
        }
    }
}

/// An additional notification stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    /// Event body namespaces the stream carries (empty = all).
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Whether the stream keeps a replay log.
    #[serde(default)]
    pub replay: bool,
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Streams registered in addition to `NETCONF`.
    pub streams: Vec<StreamConfig>,
    /// Events kept per replay stream.
    pub replay_log_size: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            replay_log_size: 1024,
        }
    }
}

impl NotificationsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("NETCONFD_REPLAY_LOG_SIZE") {
            if let Ok(n) = size.parse() {
                self.replay_log_size = n;
            }
        }
    }
}

/// In-memory datastore configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// XML file whose root children become the initial running config.
    pub initial_config: Option<PathBuf>,
    /// List element name to key leaf name.
    pub list_keys: std::collections::BTreeMap<String, String>,
}

impl DatastoreConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("NETCONFD_INITIAL_CONFIG") {
            self.initial_config = Some(PathBuf::from(path));
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("NETCONFD_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("NETCONFD_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), netconf_protocol::DEFAULT_PORT);
        assert_ne!(config.network.bind_addr.port(), netconf_protocol::NETCONF_SSH_PORT);
        assert!(config.network.bind_addr.port() > 1024);
        assert_eq!(config.framing.max_chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!config.framing.randomize_chunks);
        assert_eq!(config.capabilities.features.len(), STANDARD_FEATURES.len());
        assert!(config.notifications.streams.is_empty());
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.notifications.streams.push(StreamConfig {
            name: "alarms".into(),
            namespaces: vec!["urn:example:alarms".into()],
            replay: true,
        });
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.notifications.streams, config.notifications.streams);
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:830\"\ncapabilities:\n  features: [candidate]\ndatastore:\n  list_keys:\n    user: name\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 830);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.capabilities.features, vec!["candidate".to_string()]);
        assert_eq!(config.datastore.list_keys.get("user").map(String::as_str), Some("name"));
    }

    #[test]
    fn test_validation_rejects_unknown_feature() {
        let mut config = Config::default();
        config.capabilities.features.push("teleport".into());
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = Config::default();
        config.framing.max_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/netconfd.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_, _)));
    }
}
