/// Replication module - primary-side queue replication for high availability
///
/// A backup broker subscribes to each queue on the primary with a
/// replicating subscription:
/// - Reconciles what the backup already holds against the queue (skip / dequeue)
/// - Tags every replicated message with its replication id
/// - Relays dequeues on the primary to the backup
/// - Reports when the backup has caught up (guarded backlog acknowledged)
///
/// After failover the new primary guards every queue for each backup it knew
/// about and stays in recovery until they have all caught up.
pub mod backup;
pub mod config;
pub mod event;
pub mod guard;
pub mod id_set;
pub mod primary;
pub mod snapshot;
pub mod subscription;
pub mod types;

pub use backup::BackupQueue;
pub use config::HaConfig;
pub use event::{ControlEvent, DequeueEvent, EVENT_HEADER, Event, IdEvent};
pub use guard::QueueGuard;
pub use id_set::ReplicationIdSet;
pub use primary::{Primary, PrimaryStatus, ReplicaStatus, RoleManager};
pub use snapshot::QueueSnapshot;
pub use subscription::{
    ReplicatingSubscription, SubscriptionArguments, SubscriptionFactory, SubscriptionStatus,
};
pub use types::{
    BROKER_INFO, BrokerInfo, BrokerStatus, ID_SET, QUEUE_REPLICATOR, REPLICATING_SUBSCRIPTION,
    ReplicationError, ReplicationResult,
};
