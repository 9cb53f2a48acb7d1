use super::error::{BrokerError, Result};
use super::queue::{Queue, QueueConsumer};
use super::types::{DeliveryRecord, Message, QueueCursor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Frame handed from a consumer to its session for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Queue message; the receiver must acknowledge `tag`
    Message { tag: u64, message: Message },
    /// Out-of-band message that is never acknowledged
    Event { message: Message },
}

impl Delivery {
    pub fn message(&self) -> &Message {
        match self {
            Delivery::Message { message, .. } | Delivery::Event { message } => message,
        }
    }
}

/// Delivery and acknowledgment machinery a subscription is layered on.
///
/// Implementations handle session credit, transmission and bookkeeping of
/// unacknowledged deliveries. They are called from the subscription's own
/// connection thread as well as from arbitrary I/O threads.
pub trait ConsumerBase: Send + Sync {
    fn name(&self) -> &str;

    fn cursor(&self) -> QueueCursor;

    fn set_cursor(&self, cursor: QueueCursor);

    /// Transmit a queue message. Returns false if it could not be taken.
    fn deliver(&self, cursor: &QueueCursor, message: &Message) -> Result<bool>;

    /// Transmit a message that bypasses acknowledgment tracking
    fn deliver_event(&self, message: Message) -> Result<()>;

    /// The receiver acknowledged a delivery
    fn acknowledged(&self, record: &DeliveryRecord);

    /// Pull messages from the queue into `consumer` until none are left
    fn dispatch(&self, consumer: &dyn QueueConsumer) -> Result<bool>;

    /// Request a dispatch pass
    fn notify(&self);

    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Outermost layer of a consumer: the thing a dispatch loop drives
pub trait Dispatcher: Send + Sync {
    /// Run one dispatch pass. Returns true if anything was delivered.
    fn do_dispatch(&self) -> bool;

    /// True once the dispatch loop should stop
    fn is_finished(&self) -> bool;
}

/// Consumer that ships deliveries over an unbounded tokio channel
pub struct ChannelConsumer {
    name: String,
    queue: Arc<Queue>,
    cursor: Mutex<QueueCursor>,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, DeliveryRecord>>,
    sender: mpsc::UnboundedSender<Delivery>,
    wakeup: Notify,
    cancelled: AtomicBool,
}

impl ChannelConsumer {
    /// Create a consumer on `queue` and the receiving end of its session
    pub fn new(
        name: impl Into<String>,
        queue: Arc<Queue>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = Arc::new(Self {
            name: name.into(),
            queue,
            cursor: Mutex::new(QueueCursor::start()),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::new()),
            sender,
            wakeup: Notify::new(),
            cancelled: AtomicBool::new(false),
        });
        (consumer, receiver)
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Outstanding delivery record for `tag`
    pub fn record(&self, tag: u64) -> Option<DeliveryRecord> {
        self.unacked.lock().get(&tag).cloned()
    }

    pub fn unacked(&self) -> usize {
        self.unacked.lock().len()
    }

    /// Drive `dispatcher` whenever this consumer is notified, until cancelled
    pub fn spawn_dispatcher(self: &Arc<Self>, dispatcher: Arc<dyn Dispatcher>) -> JoinHandle<()> {
        let consumer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if dispatcher.is_finished() || ConsumerBase::is_cancelled(consumer.as_ref()) {
                    break;
                }
                while dispatcher.do_dispatch() {}
                consumer.wakeup.notified().await;
            }
            debug!("Dispatcher for {} stopped", consumer.name);
        })
    }
}

impl ConsumerBase for ChannelConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn cursor(&self) -> QueueCursor {
        *self.cursor.lock()
    }

    fn set_cursor(&self, cursor: QueueCursor) {
        *self.cursor.lock() = cursor;
    }

    fn deliver(&self, _cursor: &QueueCursor, message: &Message) -> Result<bool> {
        if self.is_cancelled() {
            return Ok(false);
        }
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.unacked
            .lock()
            .insert(tag, DeliveryRecord::new(tag, message));
        trace!("{} delivering tag {} id {}", self.name, tag, message.replication_id);

        self.sender
            .send(Delivery::Message {
                tag,
                message: message.clone(),
            })
            .map_err(|_| {
                self.unacked.lock().remove(&tag);
                BrokerError::InternalError(format!("session closed for {}", self.name))
            })?;
        Ok(true)
    }

    fn deliver_event(&self, message: Message) -> Result<()> {
        self.sender
            .send(Delivery::Event { message })
            .map_err(|_| BrokerError::InternalError(format!("session closed for {}", self.name)))
    }

    fn acknowledged(&self, record: &DeliveryRecord) {
        self.unacked.lock().remove(&record.tag);
    }

    fn dispatch(&self, consumer: &dyn QueueConsumer) -> Result<bool> {
        let mut delivered = false;
        while !self.is_cancelled() && self.queue.dispatch(consumer)? {
            delivered = true;
        }
        Ok(delivered)
    }

    fn notify(&self) {
        self.wakeup.notify_one();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Consumer {} cancelled", self.name);
        }
        self.wakeup.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Plain browsing consumer: the queue delivers straight to the channel
struct Browse<'a>(&'a ChannelConsumer);

impl QueueConsumer for Browse<'_> {
    fn cursor(&self) -> QueueCursor {
        self.0.cursor()
    }

    fn set_cursor(&self, cursor: QueueCursor) {
        self.0.set_cursor(cursor)
    }

    fn deliver(&self, cursor: &QueueCursor, message: &Message) -> Result<bool> {
        ConsumerBase::deliver(self.0, cursor, message)
    }
}

impl Dispatcher for ChannelConsumer {
    fn do_dispatch(&self) -> bool {
        self.dispatch(&Browse(self)).unwrap_or(false)
    }

    fn is_finished(&self) -> bool {
        self.is_cancelled()
    }
}
