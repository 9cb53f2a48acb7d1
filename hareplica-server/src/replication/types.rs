use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Subscription argument selecting the subscription type
pub const REPLICATING_SUBSCRIPTION: &str = "ha.repsub";
/// Subscription argument carrying the subscribing broker's [`BrokerInfo`]
pub const BROKER_INFO: &str = "ha.info";
/// Subscription argument carrying the ids already held by the backup
pub const ID_SET: &str = "ha.ids";
/// Value of [`REPLICATING_SUBSCRIPTION`] for a queue replicator
pub const QUEUE_REPLICATOR: &str = "ha.qrep";

/// HA status of a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    /// Starting up, role not yet known
    #[default]
    Joining,
    /// Backup that is still catching up with the primary
    CatchUp,
    /// Backup that has caught up and can take over
    Ready,
    /// Newly promoted primary waiting for its backups
    Recovering,
    /// Primary serving clients
    Active,
    /// HA disabled
    Standalone,
}

/// Identity of a broker taking part in replication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub system_id: Uuid,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: BrokerStatus,
}

impl BrokerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            system_id: Uuid::new_v4(),
            host: host.into(),
            port,
            status: BrokerStatus::default(),
        }
    }

    pub fn with_status(mut self, status: BrokerStatus) -> Self {
        self.status = status;
        self
    }

    /// Short form used in log prefixes
    pub fn log_id(&self) -> String {
        let id = self.system_id.simple().to_string();
        format!("{}:{}({})", self.host, self.port, &id[..8])
    }
}

impl fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.log_id())
    }
}

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource deleted: {0}")]
    ResourceDeleted(String),

    #[error("Invalid id set: {0}")]
    InvalidIdSet(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Subscription cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::InvalidArgument(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;
