use super::types::BrokerInfo;
use crate::core::{Message, Queue, QueueObserver, QueuePosition, ReplicationId};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Watermark of unreplicated messages on one queue for one backup broker.
///
/// Every message enqueued after the guard is attached is *guarded* until it is
/// completed: acknowledged by the backup, skipped because the backup already
/// has it, or dequeued from the primary. [`QueueGuard::get_first`] is the
/// earliest guarded position still outstanding; once nothing is outstanding it
/// is one past the last position the guard has seen. It never moves backwards.
///
/// A guard may be shared by several subscriptions for the same backup (an old
/// and a new one during failover). Each subscription takes a hold with
/// [`attach`](Self::attach) and gives it back with [`cancel`](Self::cancel);
/// the guard detaches from the queue when the last hold is released.
pub struct QueueGuard {
    queue: Weak<Queue>,
    queue_name: String,
    broker: BrokerInfo,
    state: Mutex<GuardState>,
}

#[derive(Debug, Default)]
struct GuardState {
    /// Outstanding guarded messages by position
    delayed: BTreeMap<QueuePosition, ReplicationId>,
    positions: HashMap<ReplicationId, QueuePosition>,
    /// One past the highest position seen
    next: QueuePosition,
    first: QueuePosition,
    holders: usize,
    cancelled: bool,
}

impl GuardState {
    fn advance(&mut self) {
        let first = self
            .delayed
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next);
        self.first = self.first.max(first);
    }
}

impl QueueGuard {
    /// Create a guard and attach it to `queue`.
    ///
    /// The first guarded position is the one after the queue's back at the
    /// instant of attachment.
    pub fn new(queue: &Arc<Queue>, broker: &BrokerInfo) -> Arc<Self> {
        let guard = Arc::new(Self {
            queue: Arc::downgrade(queue),
            queue_name: queue.name().to_string(),
            broker: broker.clone(),
            state: Mutex::new(GuardState::default()),
        });

        queue.attach_observer(guard.clone(), |contents| {
            let (_, back) = contents.range();
            let mut state = guard.state.lock();
            state.next = back.next();
            state.first = state.next;
        });
        debug!(
            "Guard on {} for {} created, first guarded {}",
            guard.queue_name,
            guard.broker,
            guard.get_first()
        );
        guard
    }

    /// Earliest position whose message is still outstanding
    pub fn get_first(&self) -> QueuePosition {
        self.state.lock().first
    }

    /// Resolve a guarded message; unknown ids are ignored
    pub fn complete(&self, id: ReplicationId) {
        let mut state = self.state.lock();
        if let Some(position) = state.positions.remove(&id) {
            state.delayed.remove(&position);
            state.advance();
            trace!("Guard on {} completed id {} at {}", self.queue_name, id, position);
        }
    }

    /// Take a hold on the guard. Returns false if it was already released.
    pub fn attach(&self) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return false;
        }
        state.holders += 1;
        true
    }

    /// Give back a hold; the last one detaches the guard from its queue
    /// and drops everything outstanding.
    pub fn cancel(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.holders = state.holders.saturating_sub(1);
            if state.holders > 0 {
                return;
            }
            state.cancelled = true;
            state.delayed.clear();
            state.positions.clear();
        }

        if let Some(queue) = self.queue.upgrade() {
            let me: Arc<dyn QueueObserver> = self.clone();
            queue.observers().remove(&me);
        }
        debug!("Guard on {} for {} cancelled", self.queue_name, self.broker);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Number of guarded messages not yet completed
    pub fn outstanding(&self) -> usize {
        self.state.lock().delayed.len()
    }

    pub fn holders(&self) -> usize {
        self.state.lock().holders
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn broker(&self) -> &BrokerInfo {
        &self.broker
    }
}

impl QueueObserver for QueueGuard {
    fn enqueued(&self, message: &Message) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        state.delayed.insert(message.sequence, message.replication_id);
        state
            .positions
            .insert(message.replication_id, message.sequence);
        state.next = state.next.max(message.sequence.next());
        state.advance();
    }

    fn dequeued(&self, message: &Message) {
        self.complete(message.replication_id);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Headers;

    fn publish(queue: &Queue) -> Message {
        queue.publish(b"m".to_vec(), Headers::new()).unwrap()
    }

    #[test]
    fn test_first_guarded_is_after_back() {
        let queue = Queue::new("q");
        publish(&queue);
        publish(&queue);

        let guard = QueueGuard::new(&queue, &BrokerInfo::new("b", 1));
        assert_eq!(guard.get_first(), QueuePosition(3));
        assert_eq!(guard.outstanding(), 0);
    }

    #[test]
    fn test_complete_advances_past_contiguous() {
        let queue = Queue::new("q");
        let guard = QueueGuard::new(&queue, &BrokerInfo::new("b", 1));
        let m1 = publish(&queue);
        let m2 = publish(&queue);
        let m3 = publish(&queue);
        assert_eq!(guard.get_first(), QueuePosition(1));
        assert_eq!(guard.outstanding(), 3);

        // Out of order completion does not move the watermark
        guard.complete(m2.replication_id);
        assert_eq!(guard.get_first(), QueuePosition(1));

        guard.complete(m1.replication_id);
        assert_eq!(guard.get_first(), QueuePosition(3));

        guard.complete(m3.replication_id);
        assert_eq!(guard.get_first(), QueuePosition(4));

        // Unknown and repeated ids are ignored
        guard.complete(m3.replication_id);
        guard.complete(999);
        assert_eq!(guard.get_first(), QueuePosition(4));
    }

    #[test]
    fn test_dequeue_completes() {
        let queue = Queue::new("q");
        let guard = QueueGuard::new(&queue, &BrokerInfo::new("b", 1));
        let m1 = publish(&queue);
        publish(&queue);

        queue.dequeue(m1.replication_id);
        assert_eq!(guard.get_first(), QueuePosition(2));
        assert_eq!(guard.outstanding(), 1);
    }

    #[test]
    fn test_shared_holds() {
        let queue = Queue::new("q");
        let guard = QueueGuard::new(&queue, &BrokerInfo::new("b", 1));
        assert!(guard.attach());
        assert!(guard.attach());
        assert_eq!(queue.observers().len(), 1);

        guard.cancel();
        assert!(!guard.is_cancelled());
        assert_eq!(queue.observers().len(), 1);

        guard.cancel();
        assert!(guard.is_cancelled());
        assert!(queue.observers().is_empty());
        assert!(!guard.attach());

        // Released guards ignore further traffic
        publish(&queue);
        assert_eq!(guard.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_complete() {
        let queue = Queue::new("q");
        let guard = QueueGuard::new(&queue, &BrokerInfo::new("b", 1));
        let ids: Vec<ReplicationId> = (0..200).map(|_| publish(&queue).replication_id).collect();

        let handles: Vec<_> = ids
            .chunks(50)
            .map(|chunk| {
                let guard = Arc::clone(&guard);
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for id in chunk {
                        guard.complete(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(guard.outstanding(), 0);
        assert_eq!(guard.get_first(), QueuePosition(201));
    }
}
