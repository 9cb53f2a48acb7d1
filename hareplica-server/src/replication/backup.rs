use super::event::ControlEvent;
use super::id_set::ReplicationIdSet;
use super::subscription::SubscriptionArguments;
use super::types::{
    BROKER_INFO, BrokerInfo, ID_SET, QUEUE_REPLICATOR, REPLICATING_SUBSCRIPTION,
    ReplicationError, ReplicationResult,
};
use crate::core::{Delivery, Message, ReplicationId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound::Included;
use tracing::trace;

#[derive(Debug, Default)]
struct BackupState {
    messages: BTreeMap<ReplicationId, Message>,
    /// Id announced for the next data message
    pending_id: Option<ReplicationId>,
    received: u64,
    dequeued: u64,
}

/// Receiving end of a replicating subscription.
///
/// Applies the stream a primary sends for one queue: an id event names the
/// next message, a dequeue event removes messages, and data messages are kept
/// under their announced id. The ids held are what the backup offers when it
/// subscribes again after failover.
#[derive(Debug)]
pub struct BackupQueue {
    name: String,
    state: Mutex<BackupState>,
}

impl BackupQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BackupState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply one frame. Returns the delivery tag to acknowledge for data
    /// messages.
    pub fn apply(&self, delivery: &Delivery) -> ReplicationResult<Option<u64>> {
        match delivery {
            Delivery::Event { message } => {
                let event = ControlEvent::from_message(message)?.ok_or_else(|| {
                    ReplicationError::InvalidEvent(format!(
                        "{}: event frame without event header",
                        self.name
                    ))
                })?;
                self.apply_event(event);
                Ok(None)
            }
            Delivery::Message { tag, message } => {
                let mut state = self.state.lock();
                let id = state.pending_id.take().ok_or_else(|| {
                    ReplicationError::InvalidEvent(format!(
                        "{}: message {} not preceded by an id",
                        self.name, message.sequence
                    ))
                })?;
                trace!("Backup {} received id {}", self.name, id);
                let mut message = message.clone();
                message.replication_id = id;
                state.messages.insert(id, message);
                state.received += 1;
                Ok(Some(*tag))
            }
        }
    }

    fn apply_event(&self, event: ControlEvent) {
        let mut state = self.state.lock();
        match event {
            ControlEvent::Id(e) => state.pending_id = Some(e.id),
            ControlEvent::Dequeue(e) => {
                trace!("Backup {} dequeue {}", self.name, e.ids);
                for (start, end) in e.ids.ranges() {
                    let ids: Vec<ReplicationId> = state
                        .messages
                        .range((Included(start), Included(end)))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in ids {
                        state.messages.remove(&id);
                        state.dequeued += 1;
                    }
                }
            }
        }
    }

    /// Ids currently held
    pub fn held_ids(&self) -> ReplicationIdSet {
        self.state.lock().messages.keys().copied().collect()
    }

    /// Messages held, in id order
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.values().cloned().collect()
    }

    pub fn contains(&self, id: ReplicationId) -> bool {
        self.state.lock().messages.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }

    /// (messages received, messages removed by dequeue events)
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.received, state.dequeued)
    }

    /// Arguments for subscribing to the primary's copy of this queue
    pub fn subscribe_arguments(&self, info: &BrokerInfo) -> ReplicationResult<SubscriptionArguments> {
        let mut arguments = SubscriptionArguments::new();
        arguments.insert(
            REPLICATING_SUBSCRIPTION.to_string(),
            Value::from(QUEUE_REPLICATOR),
        );
        arguments.insert(BROKER_INFO.to_string(), serde_json::to_value(info)?);
        arguments.insert(ID_SET.to_string(), Value::from(self.held_ids().encode()));
        Ok(arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::event::{DequeueEvent, Event, IdEvent};

    fn data(tag: u64, payload: &[u8]) -> Delivery {
        Delivery::Message {
            tag,
            message: Message::new(payload.to_vec()),
        }
    }

    fn event<E: Event>(e: E) -> Delivery {
        Delivery::Event { message: e.message() }
    }

    #[test]
    fn test_applies_ids_and_messages() {
        let backup = BackupQueue::new("q");
        assert_eq!(backup.apply(&event(IdEvent::new(7))).unwrap(), None);
        assert_eq!(backup.apply(&data(1, b"a")).unwrap(), Some(1));
        backup.apply(&event(IdEvent::new(8))).unwrap();
        backup.apply(&data(2, b"b")).unwrap();

        assert_eq!(backup.held_ids().encode(), "7-8");
        assert_eq!(backup.messages()[0].payload, b"a");
        assert_eq!(backup.counters(), (2, 0));
    }

    #[test]
    fn test_dequeue_event_removes() {
        let backup = BackupQueue::new("q");
        for (tag, id) in [(1, 1), (2, 2), (3, 5)] {
            backup.apply(&event(IdEvent::new(id))).unwrap();
            backup.apply(&data(tag, b"m")).unwrap();
        }

        let ids: ReplicationIdSet = [2, 3, 4, 5, 9].into_iter().collect();
        backup.apply(&event(DequeueEvent::new(ids))).unwrap();
        assert_eq!(backup.held_ids().encode(), "1");
        assert_eq!(backup.counters(), (3, 2));
    }

    #[test]
    fn test_message_without_id_rejected() {
        let backup = BackupQueue::new("q");
        assert!(matches!(
            backup.apply(&data(1, b"a")),
            Err(ReplicationError::InvalidEvent(_))
        ));

        // An id is consumed by exactly one message
        backup.apply(&event(IdEvent::new(1))).unwrap();
        backup.apply(&data(1, b"a")).unwrap();
        assert!(backup.apply(&data(2, b"b")).is_err());
    }

    #[test]
    fn test_subscribe_arguments() {
        let backup = BackupQueue::new("q");
        backup.apply(&event(IdEvent::new(3))).unwrap();
        backup.apply(&data(1, b"a")).unwrap();

        let info = BrokerInfo::new("b1", 5672);
        let args = backup.subscribe_arguments(&info).unwrap();
        assert_eq!(args[REPLICATING_SUBSCRIPTION], QUEUE_REPLICATOR);
        assert_eq!(args[ID_SET], "3");
        let decoded: BrokerInfo = serde_json::from_value(args[BROKER_INFO].clone()).unwrap();
        assert_eq!(decoded, info);
    }
}
