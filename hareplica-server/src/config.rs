use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::replication::HaConfig;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: Server,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ha: HaConfig,
    /// Queues created at start-up
    #[serde(default)]
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: Server {
                host: "0.0.0.0".to_string(),
                port: 15600,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
            ha: HaConfig::default(),
            queues: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        config.ha.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server_addr(), "0.0.0.0:15600");
        assert!(!config.ha.enabled);
        assert!(config.queues.is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
server:
  host: 127.0.0.1
  port: 16000
logging:
  level: debug
  format: plain
ha:
  enabled: true
  broker_port: 5673
queues: [orders, events]
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:16000");
        assert_eq!(config.logging.format, "plain");
        assert!(config.ha.enabled);
        assert_eq!(config.ha.broker_port, 5673);
        assert_eq!(config.queues, vec!["orders", "events"]);
    }

    #[test]
    fn test_invalid_ha_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
server: {{host: 127.0.0.1, port: 16000}}
logging: {{level: info, format: json}}
ha: {{enabled: true, broker_port: 0}}
"#
        )
        .unwrap();

        assert!(ServerConfig::from_file(file.path()).is_err());
    }
}
