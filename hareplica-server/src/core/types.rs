use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Add;

/// Replication identifier assigned to every message enqueued on a queue.
///
/// Ids are strictly increasing within a queue and never reused. Unlike
/// [`QueuePosition`] they survive failover: a promoted primary keeps numbering
/// from where the old primary left off.
pub type ReplicationId = u64;

/// Ordering key over a queue's message sequence
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct QueuePosition(pub u64);

impl QueuePosition {
    pub const ZERO: QueuePosition = QueuePosition(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> QueuePosition {
        self + 1
    }
}

impl Add<u64> for QueuePosition {
    type Output = QueuePosition;

    fn add(self, rhs: u64) -> QueuePosition {
        QueuePosition(self.0.saturating_add(rhs))
    }
}

impl From<u64> for QueuePosition {
    fn from(value: u64) -> Self {
        QueuePosition(value)
    }
}

impl fmt::Display for QueuePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message resident on (or delivered from) a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Position of the message in its queue
    pub sequence: QueuePosition,
    /// Replication id, stable across brokers
    pub replication_id: ReplicationId,
    /// Message payload (bytes)
    pub payload: Vec<u8>,
    /// Custom headers
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Create a message that has not been placed on a queue yet
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            sequence: QueuePosition::ZERO,
            replication_id: 0,
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Position of a consumer in a queue's browse order.
///
/// `None` means the consumer has not seen any message yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCursor {
    position: Option<QueuePosition>,
}

impl QueueCursor {
    /// Cursor positioned before the first message
    pub fn start() -> Self {
        Self { position: None }
    }

    /// Cursor positioned on `position`
    pub fn at(position: QueuePosition) -> Self {
        Self {
            position: Some(position),
        }
    }

    pub fn position(&self) -> Option<QueuePosition> {
        self.position
    }

    /// True if a message at `position` comes after this cursor
    pub fn is_before(&self, position: QueuePosition) -> bool {
        self.position.is_none_or(|current| position > current)
    }
}

/// Record of a delivery awaiting acknowledgment by the receiving session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    /// Session-local delivery tag
    pub tag: u64,
    pub sequence: QueuePosition,
    pub replication_id: ReplicationId,
}

impl DeliveryRecord {
    pub fn new(tag: u64, message: &Message) -> Self {
        Self {
            tag,
            sequence: message.sequence,
            replication_id: message.replication_id,
        }
    }
}
