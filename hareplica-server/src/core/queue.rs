use super::error::{BrokerError, Result};
use super::types::{Message, QueueCursor, QueuePosition, ReplicationId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use tracing::{debug, trace};

/// Observer of a queue's enqueue/dequeue activity.
///
/// Callbacks run while the queue holds its message lock, so the observer sees
/// events in queue order. Implementations must not call back into the queue.
pub trait QueueObserver: Send + Sync {
    /// A message was placed on the queue
    fn enqueued(&self, _message: &Message) {}

    /// A message was removed from the queue
    fn dequeued(&self, _message: &Message) {}

    /// Upcast used by [`QueueObservers::find`]
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Ordered collection of observers attached to one queue
#[derive(Default)]
pub struct QueueObservers {
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
}

impl QueueObservers {
    pub fn add(&self, observer: Arc<dyn QueueObserver>) {
        self.observers.write().push(observer);
    }

    /// Remove an observer by identity. Returns false if it was not attached.
    pub fn remove(&self, observer: &Arc<dyn QueueObserver>) -> bool {
        let target = Arc::as_ptr(observer) as *const ();
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| Arc::as_ptr(o) as *const () != target);
        observers.len() != before
    }

    /// Find the first observer of concrete type `T`
    pub fn find<T: QueueObserver + 'static>(&self) -> Option<Arc<T>> {
        self.observers
            .read()
            .iter()
            .find_map(|o| Arc::clone(o).into_any().downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    fn for_each(&self, mut f: impl FnMut(&dyn QueueObserver)) {
        for observer in self.observers.read().iter() {
            f(observer.as_ref());
        }
    }
}

/// Receiver side of a queue dispatch pass
pub trait QueueConsumer: Send + Sync {
    /// Current browse position
    fn cursor(&self) -> QueueCursor;

    /// Move the browse position after a successful delivery
    fn set_cursor(&self, cursor: QueueCursor);

    /// Offer a message. Returns false if the consumer could not take it.
    fn deliver(&self, cursor: &QueueCursor, message: &Message) -> Result<bool>;
}

/// Queue statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub acquired: usize,
    pub published: u64,
    pub dequeued: u64,
    pub observers: usize,
}

#[derive(Debug)]
struct Entry {
    message: Message,
    acquired_by: Option<String>,
}

#[derive(Debug)]
struct QueueInner {
    messages: BTreeMap<QueuePosition, Entry>,
    positions: HashMap<ReplicationId, QueuePosition>,
    /// Last assigned position
    back: QueuePosition,
    next_id: ReplicationId,
    deleted: bool,
    published: u64,
    dequeued: u64,
}

impl QueueInner {
    fn range(&self) -> (QueuePosition, QueuePosition) {
        let front = self
            .messages
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.back.next());
        (front, self.back)
    }
}

/// Read-only view of a queue handed to [`Queue::attach_observer`]
pub struct QueueContents<'a> {
    inner: &'a QueueInner,
}

impl QueueContents<'_> {
    /// (front, back) at the instant of attachment
    pub fn range(&self) -> (QueuePosition, QueuePosition) {
        self.inner.range()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.inner.messages.values().map(|e| &e.message)
    }
}

/// Sequenced in-memory queue.
///
/// Every enqueued message gets the next [`QueuePosition`] and the next
/// [`ReplicationId`]. Messages stay resident until dequeued; consumers either
/// acquire them (normal consumption) or browse them (replication).
pub struct Queue {
    name: String,
    inner: Mutex<QueueInner>,
    observers: QueueObservers,
}

impl Queue {
    /// Create a new queue whose replication ids start at 1
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_next_id(name, 1)
    }

    /// Create a queue continuing an existing replication id sequence
    pub fn with_next_id(name: impl Into<String>, next_id: ReplicationId) -> Arc<Self> {
        let name = name.into();
        debug!("Creating queue: {} (next id {})", name, next_id);
        Arc::new(Self {
            name,
            inner: Mutex::new(QueueInner {
                messages: BTreeMap::new(),
                positions: HashMap::new(),
                back: QueuePosition::ZERO,
                next_id: next_id.max(1),
                deleted: false,
                published: 0,
                dequeued: 0,
            }),
            observers: QueueObservers::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observers(&self) -> &QueueObservers {
        &self.observers
    }

    /// Attach an observer and initialise it from the queue contents atomically.
    ///
    /// No enqueue or dequeue can happen between `init` running and the
    /// observer receiving its first callback.
    pub fn attach_observer<R>(
        &self,
        observer: Arc<dyn QueueObserver>,
        init: impl FnOnce(&QueueContents<'_>) -> R,
    ) -> R {
        let inner = self.inner.lock();
        let result = init(&QueueContents { inner: &inner });
        self.observers.add(observer);
        result
    }

    /// Publish a payload, assigning position and replication id
    pub fn publish(&self, payload: Vec<u8>, headers: HashMap<String, String>) -> Result<Message> {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return Err(BrokerError::QueueDeleted(self.name.clone()));
        }

        let sequence = inner.back.next();
        let replication_id = inner.next_id;
        inner.back = sequence;
        inner.next_id += 1;
        inner.published += 1;

        let message = Message {
            sequence,
            replication_id,
            payload,
            headers,
        };
        inner.positions.insert(replication_id, sequence);
        inner.messages.insert(
            sequence,
            Entry {
                message: message.clone(),
                acquired_by: None,
            },
        );
        trace!("Enqueued {}[{}] id {}", self.name, sequence, replication_id);

        self.observers.for_each(|o| o.enqueued(&message));
        Ok(message)
    }

    /// Remove a message by replication id
    pub fn dequeue(&self, id: ReplicationId) -> Option<Message> {
        let mut inner = self.inner.lock();
        let position = inner.positions.remove(&id)?;
        let entry = inner.messages.remove(&position)?;
        inner.dequeued += 1;
        trace!("Dequeued {}[{}] id {}", self.name, position, id);

        self.observers.for_each(|o| o.dequeued(&entry.message));
        Some(entry.message)
    }

    /// Acquire the first unacquired message for `consumer_id`
    pub fn acquire(&self, consumer_id: &str) -> Option<Message> {
        let mut inner = self.inner.lock();
        inner
            .messages
            .values_mut()
            .find(|e| e.acquired_by.is_none())
            .map(|e| {
                e.acquired_by = Some(consumer_id.to_string());
                e.message.clone()
            })
    }

    /// Make an acquired message available again
    pub fn release(&self, id: ReplicationId) -> bool {
        let mut inner = self.inner.lock();
        let Some(position) = inner.positions.get(&id).copied() else {
            return false;
        };
        match inner.messages.get_mut(&position) {
            Some(entry) if entry.acquired_by.is_some() => {
                entry.acquired_by = None;
                true
            }
            _ => false,
        }
    }

    /// Dequeue every resident message, returning how many were removed
    pub fn purge(&self) -> usize {
        let ids: Vec<ReplicationId> = self.inner.lock().positions.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.dequeue(id)).count()
    }

    /// Position of the first resident message and the last assigned position.
    /// An empty queue reports `front == back + 1`.
    pub fn get_range(&self) -> (QueuePosition, QueuePosition) {
        self.inner.lock().range()
    }

    /// First resident message after `cursor`
    pub fn next_after(&self, cursor: &QueueCursor) -> Option<Message> {
        let inner = self.inner.lock();
        let lower = match cursor.position() {
            Some(p) => Excluded(p),
            None => Unbounded,
        };
        inner
            .messages
            .range((lower, Unbounded))
            .next()
            .map(|(_, e)| e.message.clone())
    }

    /// Offer the next message after the consumer's cursor.
    ///
    /// The queue lock is released before `consumer.deliver` runs. Returns true
    /// if a message was delivered.
    pub fn dispatch(&self, consumer: &dyn QueueConsumer) -> Result<bool> {
        let Some(message) = self.next_after(&consumer.cursor()) else {
            return Ok(false);
        };
        let cursor = QueueCursor::at(message.sequence);
        if consumer.deliver(&cursor, &message)? {
            consumer.set_cursor(cursor);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn contains(&self, id: ReplicationId) -> bool {
        self.inner.lock().positions.contains_key(&id)
    }

    /// Replication ids of all resident messages, in queue order
    pub fn ids(&self) -> Vec<ReplicationId> {
        self.inner
            .lock()
            .messages
            .values()
            .map(|e| e.message.replication_id)
            .collect()
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.messages.len(),
            acquired: inner
                .messages
                .values()
                .filter(|e| e.acquired_by.is_some())
                .count(),
            published: inner.published,
            dequeued: inner.dequeued,
            observers: self.observers.len(),
        }
    }

    /// Tear the queue down: refuse further publishes and detach every observer
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.deleted = true;
        self.observers.observers.write().clear();
        debug!("Queue {} destroyed", self.name);
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        enqueued: AtomicUsize,
        dequeued: AtomicUsize,
    }

    impl QueueObserver for CountingObserver {
        fn enqueued(&self, _message: &Message) {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
        }

        fn dequeued(&self, _message: &Message) {
            self.dequeued.fetch_add(1, Ordering::SeqCst);
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Browser {
        cursor: Mutex<QueueCursor>,
        seen: Mutex<Vec<ReplicationId>>,
    }

    impl QueueConsumer for Browser {
        fn cursor(&self) -> QueueCursor {
            *self.cursor.lock()
        }

        fn set_cursor(&self, cursor: QueueCursor) {
            *self.cursor.lock() = cursor;
        }

        fn deliver(&self, _cursor: &QueueCursor, message: &Message) -> Result<bool> {
            self.seen.lock().push(message.replication_id);
            Ok(true)
        }
    }

    fn publish_n(queue: &Queue, n: usize) {
        for i in 0..n {
            queue
                .publish(format!("msg{}", i).into_bytes(), HashMap::new())
                .unwrap();
        }
    }

    #[test]
    fn test_publish_assigns_positions_and_ids() {
        let queue = Queue::with_next_id("q", 100);
        let first = queue.publish(b"a".to_vec(), HashMap::new()).unwrap();
        let second = queue.publish(b"b".to_vec(), HashMap::new()).unwrap();

        assert_eq!(first.sequence, QueuePosition(1));
        assert_eq!(first.replication_id, 100);
        assert_eq!(second.sequence, QueuePosition(2));
        assert_eq!(second.replication_id, 101);
    }

    #[test]
    fn test_get_range() {
        let queue = Queue::new("q");
        assert_eq!(queue.get_range(), (QueuePosition(1), QueuePosition(0)));

        publish_n(&queue, 3);
        assert_eq!(queue.get_range(), (QueuePosition(1), QueuePosition(3)));

        queue.dequeue(1);
        assert_eq!(queue.get_range(), (QueuePosition(2), QueuePosition(3)));

        queue.purge();
        assert_eq!(queue.get_range(), (QueuePosition(4), QueuePosition(3)));
    }

    #[test]
    fn test_observers_notified() {
        let queue = Queue::new("q");
        let observer = Arc::new(CountingObserver::default());
        queue.observers().add(observer.clone());

        publish_n(&queue, 2);
        queue.dequeue(2);
        assert!(queue.dequeue(2).is_none());

        assert_eq!(observer.enqueued.load(Ordering::SeqCst), 2);
        assert_eq!(observer.dequeued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_find_and_remove() {
        let queue = Queue::new("q");
        let observer = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn QueueObserver> = observer.clone();
        queue.observers().add(as_dyn.clone());

        let found = queue.observers().find::<CountingObserver>().unwrap();
        assert!(Arc::ptr_eq(&found, &observer));

        assert!(queue.observers().remove(&as_dyn));
        assert!(!queue.observers().remove(&as_dyn));
        assert!(queue.observers().find::<CountingObserver>().is_none());
    }

    #[test]
    fn test_dispatch_browses_in_order() {
        let queue = Queue::new("q");
        publish_n(&queue, 3);
        let browser = Browser {
            cursor: Mutex::new(QueueCursor::start()),
            seen: Mutex::new(Vec::new()),
        };

        while queue.dispatch(&browser).unwrap() {}
        assert_eq!(*browser.seen.lock(), vec![1, 2, 3]);
        // Browsing leaves messages on the queue
        assert_eq!(queue.depth(), 3);

        publish_n(&queue, 1);
        assert!(queue.dispatch(&browser).unwrap());
        assert_eq!(browser.seen.lock().last(), Some(&4));
    }

    #[test]
    fn test_acquire_release() {
        let queue = Queue::new("q");
        publish_n(&queue, 2);

        let m1 = queue.acquire("c1").unwrap();
        let m2 = queue.acquire("c1").unwrap();
        assert_eq!((m1.replication_id, m2.replication_id), (1, 2));
        assert!(queue.acquire("c1").is_none());

        assert!(queue.release(1));
        assert!(!queue.release(1));
        assert_eq!(queue.acquire("c2").unwrap().replication_id, 1);
    }

    #[test]
    fn test_destroy_detaches_observers() {
        let queue = Queue::new("q");
        queue
            .observers()
            .add(Arc::new(CountingObserver::default()));
        queue.destroy();

        assert!(queue.observers().is_empty());
        assert!(matches!(
            queue.publish(b"x".to_vec(), HashMap::new()),
            Err(BrokerError::QueueDeleted(_))
        ));
    }

    #[test]
    fn test_attach_observer_sees_contents() {
        let queue = Queue::new("q");
        publish_n(&queue, 2);
        let observer = Arc::new(CountingObserver::default());

        let (ids, range) = queue.attach_observer(observer.clone(), |contents| {
            (
                contents
                    .messages()
                    .map(|m| m.replication_id)
                    .collect::<Vec<_>>(),
                contents.range(),
            )
        });
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(range, (QueuePosition(1), QueuePosition(2)));
        assert_eq!(observer.enqueued.load(Ordering::SeqCst), 0);
    }
}
