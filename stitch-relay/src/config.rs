//! Relay configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Allow proxying to loopback and private network targets
    pub allow_private_targets: bool,
    /// Upstream connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Maximum size of a forwarded request body in bytes
    pub body_limit: usize,
    /// Directory for daily rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 12556,
            allow_private_targets: false,
            connect_timeout_secs: 10,
            body_limit: 10 * 1024 * 1024, // 10MB
            log_dir: None,
        }
    }
}

impl RelayConfig {
    /// Load relay config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `RELAY_BIND_ADDRESS` (e.g. "127.0.0.1")
    /// - `RELAY_PORT` (e.g. "8080")
    /// - `RELAY_ALLOW_PRIVATE_TARGETS` ("true"/"1")
    /// - `RELAY_CONNECT_TIMEOUT_SECS`
    /// - `RELAY_LOG_DIR`
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(bind_address) = lookup("RELAY_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            config.bind_address = bind_address.trim().to_string();
        }

        if let Some(port) = lookup("RELAY_PORT")
            && let Ok(parsed) = port.trim().parse::<u16>()
        {
            config.port = parsed;
        }

        if let Some(flag) = lookup("RELAY_ALLOW_PRIVATE_TARGETS") {
            config.allow_private_targets =
                matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(secs) = lookup("RELAY_CONNECT_TIMEOUT_SECS")
            && let Ok(parsed) = secs.trim().parse::<u64>()
            && parsed > 0
        {
            config.connect_timeout_secs = parsed;
        }

        if let Some(dir) = lookup("RELAY_LOG_DIR")
            && !dir.trim().is_empty()
        {
            config.log_dir = Some(PathBuf::from(dir.trim()));
        }

        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
