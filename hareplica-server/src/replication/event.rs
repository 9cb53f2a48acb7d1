//! Control events carried to the backup on the replication stream.
//!
//! An event is an ordinary [`Message`] marked with the [`EVENT_HEADER`] header;
//! the header value names the event and the payload carries its argument as
//! UTF-8 text.
use super::id_set::ReplicationIdSet;
use super::types::{ReplicationError, ReplicationResult};
use crate::core::{Message, ReplicationId};

/// Header marking a message as a control event
pub const EVENT_HEADER: &str = "ha.event";

pub trait Event: Sized {
    /// Value of [`EVENT_HEADER`] identifying this event
    const KEY: &'static str;

    fn encode(&self) -> String;

    fn decode(payload: &str) -> ReplicationResult<Self>;

    /// Wrap the event in a message ready for delivery
    fn message(&self) -> Message {
        Message::new(self.encode().into_bytes()).with_header(EVENT_HEADER, Self::KEY)
    }
}

/// The id of the next message on the replication stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdEvent {
    pub id: ReplicationId,
}

impl IdEvent {
    pub fn new(id: ReplicationId) -> Self {
        Self { id }
    }
}

impl Event for IdEvent {
    const KEY: &'static str = "ha.id";

    fn encode(&self) -> String {
        self.id.to_string()
    }

    fn decode(payload: &str) -> ReplicationResult<Self> {
        payload
            .trim()
            .parse()
            .map(IdEvent::new)
            .map_err(|e| ReplicationError::InvalidEvent(format!("bad id {:?}: {}", payload, e)))
    }
}

/// Ids no longer on the primary that the backup must remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueEvent {
    pub ids: ReplicationIdSet,
}

impl DequeueEvent {
    pub fn new(ids: ReplicationIdSet) -> Self {
        Self { ids }
    }
}

impl Event for DequeueEvent {
    const KEY: &'static str = "ha.dequeue";

    fn encode(&self) -> String {
        self.ids.encode()
    }

    fn decode(payload: &str) -> ReplicationResult<Self> {
        ReplicationIdSet::decode(payload).map(DequeueEvent::new)
    }
}

/// Decoded control event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Id(IdEvent),
    Dequeue(DequeueEvent),
}

impl ControlEvent {
    pub fn is_event(message: &Message) -> bool {
        message.headers.contains_key(EVENT_HEADER)
    }

    /// Decode `message`; `Ok(None)` if it is not a control event
    pub fn from_message(message: &Message) -> ReplicationResult<Option<ControlEvent>> {
        let Some(key) = message.header(EVENT_HEADER) else {
            return Ok(None);
        };
        let payload = std::str::from_utf8(&message.payload)
            .map_err(|e| ReplicationError::InvalidEvent(format!("{} payload: {}", key, e)))?;

        if key == IdEvent::KEY {
            IdEvent::decode(payload).map(|e| Some(ControlEvent::Id(e)))
        } else if key == DequeueEvent::KEY {
            DequeueEvent::decode(payload).map(|e| Some(ControlEvent::Dequeue(e)))
        } else {
            Err(ReplicationError::InvalidEvent(format!(
                "unknown event {:?}",
                key
            )))
        }
    }
}
