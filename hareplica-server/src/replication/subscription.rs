//! Primary-side subscription that streams one queue to one backup broker.
//!
//! The subscription browses the queue like any other consumer, but in
//! addition it
//! - reconciles the backup's existing contents against the queue when it is
//!   created (messages the backup already has are skipped, messages the
//!   primary no longer has are sent as a [`DequeueEvent`]),
//! - prefixes every replicated message with an [`IdEvent`],
//! - relays dequeues on the primary to the backup, batched per dispatch pass,
//! - decides when the backup has caught up and tells the [`RoleManager`].
//!
//! All mutable protocol state lives behind one mutex. Calls that leave this
//! component (role manager notifications, delivery to the base consumer, event
//! transmission) are made with the lock released.
use super::event::{DequeueEvent, Event, IdEvent};
use super::guard::QueueGuard;
use super::id_set::ReplicationIdSet;
use super::primary::RoleManager;
use super::snapshot::QueueSnapshot;
use super::types::{
    BROKER_INFO, BrokerInfo, ID_SET, QUEUE_REPLICATOR, REPLICATING_SUBSCRIPTION,
    ReplicationError, ReplicationResult,
};
use crate::core::{
    ConsumerBase, DeliveryRecord, Dispatcher, Message, Queue, QueueConsumer, QueueCursor,
    QueueObserver, QueuePosition, Result,
};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info, trace, warn};

/// Arguments supplied by the backup when it subscribes
pub type SubscriptionArguments = HashMap<String, Value>;

/// Creates replicating subscriptions for consumers that ask for one
pub struct SubscriptionFactory {
    role: Option<Arc<dyn RoleManager>>,
}

impl SubscriptionFactory {
    pub fn new(role: Option<Arc<dyn RoleManager>>) -> Self {
        Self { role }
    }

    /// Create and initialise a replicating subscription.
    ///
    /// Returns `Ok(None)` if `arguments` do not request a queue replicator.
    /// A subscription that fails to initialise is cancelled before the error
    /// is returned.
    pub fn create(
        &self,
        name: impl Into<String>,
        queue: Arc<Queue>,
        base: Arc<dyn ConsumerBase>,
        arguments: SubscriptionArguments,
    ) -> ReplicationResult<Option<Arc<ReplicatingSubscription>>> {
        match arguments.get(REPLICATING_SUBSCRIPTION).and_then(Value::as_str) {
            Some(QUEUE_REPLICATOR) => {}
            _ => return Ok(None),
        }

        let subscription =
            ReplicatingSubscription::new(name, queue, base, self.role.clone(), arguments);
        if let Err(e) = subscription.initialize() {
            subscription.cancel();
            return Err(e);
        }
        Ok(Some(subscription))
    }
}

#[derive(Debug, Default)]
struct SubscriptionState {
    /// Last position delivered (or skipped)
    position: QueuePosition,
    /// Already on the backup, pass over without sending
    skip: ReplicationIdSet,
    /// Dequeued on the primary, not yet relayed
    dequeues: ReplicationIdSet,
    /// Sent from the unguarded backlog and not yet acknowledged
    unready: ReplicationIdSet,
    ready: bool,
    cancelled: bool,
}

/// Point-in-time view of a subscription's protocol state
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub name: String,
    pub queue: String,
    pub broker: Option<BrokerInfo>,
    pub position: QueuePosition,
    pub guard_first: Option<QueuePosition>,
    pub skip: ReplicationIdSet,
    pub unready: ReplicationIdSet,
    pub pending_dequeues: ReplicationIdSet,
    pub ready: bool,
    pub cancelled: bool,
}

pub struct ReplicatingSubscription {
    name: String,
    queue: Arc<Queue>,
    base: Arc<dyn ConsumerBase>,
    role: Option<Arc<dyn RoleManager>>,
    arguments: SubscriptionArguments,
    weak_self: Weak<ReplicatingSubscription>,
    info: OnceLock<BrokerInfo>,
    guard: OnceLock<Arc<QueueGuard>>,
    log_prefix: OnceLock<String>,
    state: Mutex<SubscriptionState>,
}

impl ReplicatingSubscription {
    /// Construct an uninitialised subscription; see [`initialize`](Self::initialize)
    pub fn new(
        name: impl Into<String>,
        queue: Arc<Queue>,
        base: Arc<dyn ConsumerBase>,
        role: Option<Arc<dyn RoleManager>>,
        arguments: SubscriptionArguments,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak_self| Self {
            name,
            queue,
            base,
            role,
            arguments,
            weak_self: weak_self.clone(),
            info: OnceLock::new(),
            guard: OnceLock::new(),
            log_prefix: OnceLock::new(),
            state: Mutex::new(SubscriptionState::default()),
        })
    }

    /// Reconcile with the backup and start observing the queue.
    ///
    /// Runs once, in the subscription's connection thread, right after
    /// construction. Failure is fatal: the caller must cancel the
    /// subscription.
    pub fn initialize(&self) -> ReplicationResult<()> {
        self.try_initialize().inspect_err(|e| {
            error!("{}Subscribe failed: {}", self.log_prefix(), e);
        })
    }

    fn try_initialize(&self) -> ReplicationResult<()> {
        let Some(info) = self.arguments.get(BROKER_INFO) else {
            return Err(ReplicationError::InvalidArgument(format!(
                "Can't subscribe, no broker info: {}",
                self.name
            )));
        };
        let info: BrokerInfo = serde_json::from_value(info.clone()).map_err(|e| {
            ReplicationError::InvalidArgument(format!(
                "Can't subscribe, bad broker info: {}: {}",
                self.name, e
            ))
        })?;
        if self.info.set(info.clone()).is_err() {
            return Err(ReplicationError::InvalidArgument(format!(
                "{} already initialized",
                self.name
            )));
        }
        let _ = self.log_prefix.set(format!(
            "Subscription to {} at {}: ",
            self.queue.name(),
            info
        ));

        let backup_ids = match self.arguments.get(ID_SET) {
            None => ReplicationIdSet::new(),
            Some(Value::String(encoded)) => ReplicationIdSet::decode(encoded)?,
            Some(other) => {
                return Err(ReplicationError::InvalidArgument(format!(
                    "{}{} must be a string, got {}",
                    self.log_prefix(),
                    ID_SET,
                    other
                )));
            }
        };

        // Failover may already have created a guard for this backup.
        let guard = self
            .role
            .as_ref()
            .and_then(|role| role.get_guard(&self.queue, &info))
            .filter(|guard| guard.attach())
            .unwrap_or_else(|| {
                let guard = QueueGuard::new(&self.queue, &info);
                guard.attach();
                guard
            });
        let _ = self.guard.set(Arc::clone(&guard));

        // Once the observer is attached dequeued() can run concurrently. It
        // must be attached before the snapshot so no dequeue falls between.
        let me = self.as_observer()?;
        self.queue.observers().add(Arc::clone(&me));
        let Some(snapshot) = self.queue.observers().find::<QueueSnapshot>() else {
            self.queue.observers().remove(&me);
            return Err(ReplicationError::ResourceDeleted(format!(
                "{}Can't subscribe, queue deleted",
                self.log_prefix()
            )));
        };
        let primary_ids = snapshot.get_snapshot();

        // On the backup but no longer on the primary
        let init_dequeues = &backup_ids - &primary_ids;
        // get_range locks the queue, so call it before taking our lock
        let (front, back) = self.queue.get_range();
        {
            let mut state = self.state.lock();
            state.dequeues += &init_dequeues;
            state.skip = &backup_ids - &init_dequeues;
            // The front may move, but this subscription starts at or after it,
            // so if the front is guarded so is our position.
            state.position = front;
            debug!(
                "{}Subscribed: front {}, back {}, guarded {}, on backup {}",
                self.log_prefix(),
                front,
                back,
                guard.get_first(),
                state.skip
            );
            self.check_ready(state);
        }

        if let Some(role) = &self.role {
            role.add_replica(self);
        }
        // dequeued() may have added more since we released the lock
        self.send_dequeue_event(self.state.lock())
    }

    /// Observe the queue in the backup's I/O thread: the backup acknowledged
    /// a replicated message.
    pub fn acknowledged(&self, record: &DeliveryRecord) {
        let id = record.replication_id;
        trace!(
            "{}Acknowledged {}[{}] id {}",
            self.log_prefix(),
            self.queue.name(),
            record.sequence,
            id
        );
        if let Some(guard) = self.guard.get() {
            guard.complete(id);
        }
        {
            let mut state = self.state.lock();
            state.unready.remove(id);
            self.check_ready(state);
        }
        self.base.acknowledged(record);
    }

    /// One dispatch pass: relay pending dequeues, then deliver what the queue
    /// has. Failures are logged and end the pass; the next notification
    /// retries.
    pub fn dispatch(&self) -> bool {
        let state = self.state.lock();
        if state.cancelled {
            return false;
        }
        if let Err(e) = self.send_dequeue_event(state) {
            warn!("{}Exception in dispatch: {}", self.log_prefix(), e);
            return false;
        }
        match self.base.dispatch(self) {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!("{}Exception in dispatch: {}", self.log_prefix(), e);
                false
            }
        }
    }

    /// Stop replicating. Idempotent.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
        }
        debug!("{}Cancelled", self.log_prefix());

        if let Some(role) = &self.role {
            role.remove_replica(self);
        }
        if let Ok(me) = self.as_observer() {
            self.queue.observers().remove(&me);
        }
        if let Some(guard) = self.guard.get() {
            guard.cancel();
        }
        self.base.cancel();
    }

    /// Add ids the backup is known to hold already
    pub fn add_skip(&self, ids: &ReplicationIdSet) {
        self.state.lock().skip += ids;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Remote broker, known once initialised
    pub fn broker_info(&self) -> Option<&BrokerInfo> {
        self.info.get()
    }

    pub fn guard(&self) -> Option<&Arc<QueueGuard>> {
        self.guard.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn status(&self) -> SubscriptionStatus {
        let state = self.state.lock();
        SubscriptionStatus {
            name: self.name.clone(),
            queue: self.queue.name().to_string(),
            broker: self.info.get().cloned(),
            position: state.position,
            guard_first: self.guard.get().map(|g| g.get_first()),
            skip: state.skip.clone(),
            unready: state.unready.clone(),
            pending_dequeues: state.dequeues.clone(),
            ready: state.ready,
            cancelled: state.cancelled,
        }
    }

    pub fn log_prefix(&self) -> &str {
        self.log_prefix.get().map(String::as_str).unwrap_or("")
    }

    fn as_observer(&self) -> ReplicationResult<Arc<dyn QueueObserver>> {
        let me: Arc<dyn QueueObserver> = self
            .weak_self
            .upgrade()
            .ok_or_else(|| ReplicationError::Cancelled(self.name.clone()))?;
        Ok(me)
    }

    /// True if the next position to deliver is guarded
    fn is_guarded(&self, state: &SubscriptionState) -> bool {
        self.guard
            .get()
            .is_some_and(|guard| state.position + 1 >= guard.get_first())
    }

    /// Declare the subscription ready if it has caught up. Consumes the lock
    /// so it can be released before the role manager is told.
    fn check_ready(&self, mut state: MutexGuard<'_, SubscriptionState>) {
        if state.ready || state.cancelled || !state.unready.is_empty() || !self.is_guarded(&state)
        {
            return;
        }
        state.ready = true;
        drop(state);

        info!("{}Caught up", self.log_prefix());
        if let Some(role) = &self.role {
            role.ready_replica(self);
        }
    }

    /// Flush accumulated dequeues as one event. Consumes the lock.
    fn send_dequeue_event(
        &self,
        mut state: MutexGuard<'_, SubscriptionState>,
    ) -> ReplicationResult<()> {
        if state.dequeues.is_empty() {
            return Ok(());
        }
        let ids = std::mem::take(&mut state.dequeues);
        drop(state);

        trace!("{}Sending dequeues {}", self.log_prefix(), ids);
        let event = DequeueEvent::new(ids);
        self.send_event(&event).inspect_err(|_| {
            // Keep them for the next pass
            self.state.lock().dequeues += &event.ids;
        })
    }

    /// Events go straight to the base consumer and are never acknowledged
    fn send_event<E: Event>(&self, event: &E) -> ReplicationResult<()> {
        self.base
            .deliver_event(event.message())
            .map_err(|e| ReplicationError::Delivery(e.to_string()))
    }

    fn replicate(&self, cursor: &QueueCursor, message: &Message) -> Result<bool> {
        let id = message.replication_id;
        let mut state = self.state.lock();
        if state.cancelled {
            return Ok(false);
        }
        state.position = message.sequence;

        if state.skip.contains(id) {
            trace!(
                "{}Skip {}[{}] id {}",
                self.log_prefix(),
                self.queue.name(),
                message.sequence,
                id
            );
            state.skip.remove(id);
            drop(state);
            // Never sent, so it will never be acknowledged
            if let Some(guard) = self.guard.get() {
                guard.complete(id);
            }
            self.base.notify();
            self.check_ready(self.state.lock());
            return Ok(true);
        }

        trace!(
            "{}Replicated {}[{}] id {}",
            self.log_prefix(),
            self.queue.name(),
            message.sequence,
            id
        );
        if !state.ready && !self.is_guarded(&state) {
            state.unready.insert(id);
        }
        drop(state);

        self.send_event(&IdEvent::new(id))?;
        let delivered = self.base.deliver(cursor, message)?;
        self.check_ready(self.state.lock());
        Ok(delivered)
    }
}

impl QueueConsumer for ReplicatingSubscription {
    fn cursor(&self) -> QueueCursor {
        self.base.cursor()
    }

    fn set_cursor(&self, cursor: QueueCursor) {
        self.base.set_cursor(cursor);
    }

    /// Called in the subscription's connection thread during dispatch
    fn deliver(&self, cursor: &QueueCursor, message: &Message) -> Result<bool> {
        self.replicate(cursor, message).inspect_err(|e| {
            error!(
                "{}Error replicating {}[{}] id {}: {}",
                self.log_prefix(),
                self.queue.name(),
                message.sequence,
                message.replication_id,
                e
            );
        })
    }
}

impl QueueObserver for ReplicatingSubscription {
    fn enqueued(&self, _message: &Message) {
        self.base.notify();
    }

    /// Called under the queue's lock from arbitrary connection threads
    fn dequeued(&self, message: &Message) {
        let id = message.replication_id;
        trace!("{}Dequeued id {}", self.log_prefix(), id);
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.dequeues.insert(id);
        }
        self.base.notify();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Dispatcher for ReplicatingSubscription {
    fn do_dispatch(&self) -> bool {
        self.dispatch()
    }

    fn is_finished(&self) -> bool {
        self.is_cancelled()
    }
}

impl std::fmt::Debug for ReplicatingSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatingSubscription")
            .field("name", &self.name)
            .field("queue", &self.queue.name())
            .field("broker", &self.info.get())
            .finish()
    }
}
