//! Client configuration loading.
//!
//! Programmatic construction with `Default` covers most uses; TOML loading
//! mirrors the same fields with durations in milliseconds.
//!
//! # Sections
//! - `[node]` host/port for single-node dialling
//! - `[discovery]` host/port; when present, replaces single-node dialling
//! - `[auth]` username + password (both or neither)
//! - `[timeouts]` connect_ms, heartbeat_period_ms, response_timeout_ms
//! - `[reconnect]` retries_per_node, retry_delay_ms

use std::path::Path;
use std::time::Duration;

use esdb_protocol::Credentials;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// When set, DNS discovery replaces single-node dialling.
    pub discovery_host: Option<String>,
    pub discovery_port: u16,
    /// Threaded into conversations that require auth.
    pub credentials: Option<Credentials>,
    /// Bound on one dial attempt.
    pub connect_timeout: Duration,
    /// Interval between outbound heartbeat probes.
    pub heartbeat_period: Duration,
    /// How long a probe may go unanswered before it counts as failed.
    pub response_timeout: Duration,
    /// Reconnect attempts per node before it is marked failed.
    pub retries_per_node: usize,
    /// Base delay for reconnect backoff.
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            host: "localhost".to_owned(),
            port: 1113,
            discovery_host: None,
            discovery_port: 2113,
            credentials: None,
            connect_timeout: Duration::from_secs(5),
            heartbeat_period: Duration::from_secs(30),
            response_timeout: Duration::from_secs(10),
            retries_per_node: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    node: Option<RawNodeConfig>,
    discovery: Option<RawDiscoveryConfig>,
    auth: Option<RawAuthConfig>,
    timeouts: Option<RawTimeoutsConfig>,
    reconnect: Option<RawReconnectConfig>,
}

#[derive(Debug, Deserialize)]
struct RawNodeConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawDiscoveryConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTimeoutsConfig {
    connect_ms: Option<u64>,
    heartbeat_period_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawReconnectConfig {
    retries_per_node: Option<usize>,
    retry_delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load client config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load client config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = ClientConfig::default();

    let (host, port) = match raw.node {
        Some(node) => (
            node.host.unwrap_or(defaults.host),
            node.port.unwrap_or(defaults.port),
        ),
        None => (defaults.host, defaults.port),
    };

    let (discovery_host, discovery_port) = match raw.discovery {
        Some(discovery) => {
            let host = discovery
                .host
                .ok_or_else(|| ConfigError::MissingField("discovery.host".to_owned()))?;
            (Some(host), discovery.port.unwrap_or(defaults.discovery_port))
        }
        None => (None, defaults.discovery_port),
    };

    let credentials = match raw.auth {
        Some(auth) => match (auth.username, auth.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "auth requires both username and password".to_owned(),
                ));
            }
        },
        None => None,
    };

    let (connect_timeout, heartbeat_period, response_timeout) = match raw.timeouts {
        Some(t) => (
            t.connect_ms
                .map_or(defaults.connect_timeout, Duration::from_millis),
            t.heartbeat_period_ms
                .map_or(defaults.heartbeat_period, Duration::from_millis),
            t.response_timeout_ms
                .map_or(defaults.response_timeout, Duration::from_millis),
        ),
        None => (
            defaults.connect_timeout,
            defaults.heartbeat_period,
            defaults.response_timeout,
        ),
    };

    if heartbeat_period.is_zero() {
        return Err(ConfigError::InvalidValue(
            "timeouts.heartbeat_period_ms must be greater than zero".to_owned(),
        ));
    }
    if response_timeout.is_zero() {
        return Err(ConfigError::InvalidValue(
            "timeouts.response_timeout_ms must be greater than zero".to_owned(),
        ));
    }

    let (retries_per_node, retry_delay) = match raw.reconnect {
        Some(r) => (
            r.retries_per_node.unwrap_or(defaults.retries_per_node),
            r.retry_delay_ms
                .map_or(defaults.retry_delay, Duration::from_millis),
        ),
        None => (defaults.retries_per_node, defaults.retry_delay),
    };

    Ok(ClientConfig {
        host,
        port,
        discovery_host,
        discovery_port,
        credentials,
        connect_timeout,
        heartbeat_period,
        response_timeout,
        retries_per_node,
        retry_delay,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_yields_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1113);
        assert_eq!(config.discovery_host, None);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_period, Duration::from_secs(30));
        assert_eq!(config.response_timeout, Duration::from_secs(10));
        assert_eq!(config.retries_per_node, 3);
    }

    #[test]
    fn full_config_round_trips_every_field() {
        let toml_str = r#"
            [node]
            host = "db.internal"
            port = 2113

            [discovery]
            host = "cluster.internal"
            port = 2114

            [auth]
            username = "admin"
            password = "changeit"

            [timeouts]
            connect_ms = 1500
            heartbeat_period_ms = 700
            response_timeout_ms = 300

            [reconnect]
            retries_per_node = 5
            retry_delay_ms = 50
        "#;
        let config = load_config_from_str(toml_str).unwrap();

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 2113);
        assert_eq!(config.discovery_host.as_deref(), Some("cluster.internal"));
        assert_eq!(config.discovery_port, 2114);
        let credentials = config.credentials.unwrap();
        assert_eq!(credentials.username, "admin");
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_period, Duration::from_millis(700));
        assert_eq!(config.response_timeout, Duration::from_millis(300));
        assert_eq!(config.retries_per_node, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(50));
    }

    #[test]
    fn discovery_section_without_host_is_rejected() {
        let err = load_config_from_str("[discovery]\nport = 2113\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "discovery.host"));
    }

    #[test]
    fn username_without_password_is_rejected() {
        let err = load_config_from_str("[auth]\nusername = \"admin\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn zero_heartbeat_period_is_rejected() {
        let err = load_config_from_str("[timeouts]\nheartbeat_period_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nhost = \"10.0.0.9\"\nport = 7113").unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.host, "10.0.0.9");
        assert_eq!(config.port, 7113);
    }
}
