pub mod config;
pub mod core;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::{
    BrokerError, ChannelConsumer, ConsumerBase, Delivery, Message, Queue, QueueManager,
    QueuePosition, ReplicationId,
};
pub use replication::{
    BackupQueue, BrokerInfo, BrokerStatus, HaConfig, Primary, QueueGuard, QueueSnapshot,
    ReplicatingSubscription, ReplicationError, ReplicationIdSet, RoleManager, SubscriptionFactory,
};
pub use server::{AppState, create_router};
