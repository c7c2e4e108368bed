use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use minisfu_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Signaling (WebSocket) listen address
    pub addr: String,
    /// Prometheus listen address; empty disables the metrics endpoint
    pub metrics_addr: String,
    /// Largest accepted signaling message in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8765".to_string(),
            metrics_addr: "0.0.0.0:8100".to_string(),
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                return Err(ConfigError::NotFound(path.to_string()));
            }
            builder = builder.add_source(File::with_name(path));
        }

        // Override with environment variables (MINISFU_SERVER__ADDR, MINISFU_SFU__MAX_SESSIONS, ...)
        builder = builder.add_source(
            Environment::with_prefix("MINISFU")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sfu.webrtc.nat_1to1_ips")
                .with_list_parse_key("sfu.webrtc.ice_port_range")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("server.addr '{}' is not a socket address", self.server.addr));
        }
        if !self.server.metrics_addr.is_empty()
            && self.server.metrics_addr.parse::<std::net::SocketAddr>().is_err()
        {
            errors.push(format!(
                "server.metrics_addr '{}' is not a socket address",
                self.server.metrics_addr
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors.into_iter().map(|e| format!("sfu: {e}")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.addr, "0.0.0.0:8765");
        assert_eq!(config.server.metrics_addr, "0.0.0.0:8100");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "server": {{ "addr": "127.0.0.1:9000" }},
                "sfu": {{
                    "max_peers_per_session": 4,
                    "webrtc": {{ "ice_port_range": [50000, 50200], "ice_lite": true }}
                }}
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.addr, "127.0.0.1:9000");
        assert_eq!(config.server.metrics_addr, "0.0.0.0:8100");
        assert_eq!(config.sfu.max_peers_per_session, 4);
        assert_eq!(config.sfu.webrtc.port_range(), Some((50000, 50200)));
        assert!(config.sfu.webrtc.ice_lite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/minisfu.json")).is_err());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.addr = "nowhere".to_string();
        config.logging.format = "xml".to_string();
        config.sfu.webrtc.ice_port_range = vec![50000, 50010];

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.starts_with("sfu: ice_port_range")));
    }

    #[test]
    fn test_empty_metrics_addr_disables_metrics() {
        let mut config = Config::default();
        config.server.metrics_addr = String::new();
        assert!(config.validate().is_ok());
    }
}
