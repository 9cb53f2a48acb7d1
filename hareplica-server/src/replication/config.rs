use super::types::BrokerInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// HA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// Enable replication
    pub enabled: bool,

    /// Identity of this broker; generated at start-up if absent
    pub system_id: Option<Uuid>,

    /// Host other brokers use to reach this one
    pub broker_host: String,

    /// Port other brokers use to reach this one
    pub broker_port: u16,

    /// How long a newly promoted primary waits for an expected backup (ms)
    pub backup_timeout_ms: u64,

    /// Backups known to this broker before it was promoted
    pub expected_backups: Vec<BrokerInfo>,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            system_id: None,
            broker_host: "127.0.0.1".to_string(),
            broker_port: 5672,
            backup_timeout_ms: 10000, // 10 seconds
            expected_backups: Vec::new(),
        }
    }
}

impl HaConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        if self.broker_host.is_empty() {
            return Err("HA requires broker_host".to_string());
        }
        if self.broker_port == 0 {
            return Err("HA requires a non-zero broker_port".to_string());
        }
        if self.backup_timeout_ms == 0 {
            return Err("backup_timeout_ms must be greater than zero".to_string());
        }

        let mut seen = HashSet::new();
        for backup in &self.expected_backups {
            if Some(backup.system_id) == self.system_id {
                return Err(format!("Broker {} lists itself as a backup", backup));
            }
            if !seen.insert(backup.system_id) {
                return Err(format!("Duplicate expected backup {}", backup));
            }
        }

        Ok(())
    }

    /// This broker's identity
    pub fn broker_info(&self) -> BrokerInfo {
        let mut info = BrokerInfo::new(self.broker_host.clone(), self.broker_port);
        if let Some(id) = self.system_id {
            info.system_id = id;
        }
        info
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HaConfig::default();
        assert!(!config.enabled);
        assert!(config.validate().is_ok());
        assert_eq!(config.backup_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_enabled_validation() {
        let mut config = HaConfig::default();
        config.enabled = true;
        assert!(config.validate().is_ok());

        config.broker_port = 0;
        assert!(config.validate().is_err());

        config.broker_port = 5672;
        config.backup_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expected_backups_validation() {
        let mut config = HaConfig::default();
        config.enabled = true;
        let backup = BrokerInfo::new("b1", 5672);
        config.expected_backups = vec![backup.clone(), backup.clone()];
        assert!(config.validate().is_err());

        config.expected_backups = vec![backup.clone()];
        config.system_id = Some(backup.system_id);
        assert!(config.validate().is_err());

        config.system_id = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broker_info_uses_configured_id() {
        let mut config = HaConfig::default();
        let id = Uuid::new_v4();
        config.system_id = Some(id);
        assert_eq!(config.broker_info().system_id, id);
        assert_eq!(config.broker_info().port, 5672);
    }

    #[test]
    fn test_yaml_partial() {
        let yaml = r#"
enabled: true
broker_port: 6000
expected_backups:
  - system_id: 67e55044-10b1-426f-9247-bb680e5fe0c8
    host: backup1
    port: 6001
"#;
        let config: HaConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.enabled);
        assert_eq!(config.broker_port, 6000);
        assert_eq!(config.broker_host, "127.0.0.1");
        assert_eq!(config.expected_backups[0].host, "backup1");
        assert!(config.validate().is_ok());
    }
}
