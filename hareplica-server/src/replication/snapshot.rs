use super::id_set::ReplicationIdSet;
use crate::core::{Message, Queue, QueueObserver};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

/// Tracks the replication ids resident on one queue.
///
/// One snapshot is attached to every queue when it is created and detached
/// when the queue is destroyed; a missing snapshot means the queue is going
/// away.
#[derive(Debug, Default)]
pub struct QueueSnapshot {
    ids: Mutex<ReplicationIdSet>,
}

impl QueueSnapshot {
    /// Attach a snapshot to `queue`, seeded with its current contents
    pub fn attach(queue: &Queue) -> Arc<Self> {
        let snapshot = Arc::new(Self::default());
        queue.attach_observer(snapshot.clone(), |contents| {
            snapshot
                .ids
                .lock()
                .extend(contents.messages().map(|m| m.replication_id));
        });
        snapshot
    }

    /// Ids enqueued at the instant of the call
    pub fn get_snapshot(&self) -> ReplicationIdSet {
        self.ids.lock().clone()
    }
}

impl QueueObserver for QueueSnapshot {
    fn enqueued(&self, message: &Message) {
        self.ids.lock().insert(message.replication_id);
    }

    fn dequeued(&self, message: &Message) {
        self.ids.lock().remove(message.replication_id);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
