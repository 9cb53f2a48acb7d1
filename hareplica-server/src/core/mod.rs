pub mod consumer;
pub mod error;
pub mod manager;
pub mod queue;
pub mod types;

pub use consumer::{ChannelConsumer, ConsumerBase, Delivery, Dispatcher};
pub use error::{BrokerError, Result};
pub use manager::QueueManager;
pub use queue::{Queue, QueueConsumer, QueueContents, QueueObserver, QueueObservers, QueueStats};
pub use types::{DeliveryRecord, Message, QueueCursor, QueuePosition, ReplicationId};
