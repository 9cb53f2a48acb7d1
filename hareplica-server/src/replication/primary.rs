use super::config::HaConfig;
use super::guard::QueueGuard;
use super::subscription::ReplicatingSubscription;
use super::types::{BrokerInfo, BrokerStatus};
use crate::core::Queue;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notifications a replicating subscription sends to the broker's HA role.
///
/// Called without any subscription lock held; implementations may call back
/// into the subscription.
pub trait RoleManager: Send + Sync {
    /// Guard created at promotion for `broker` on `queue`, if any.
    /// The guard is handed over: a second call returns `None`.
    fn get_guard(&self, queue: &Arc<Queue>, broker: &BrokerInfo) -> Option<Arc<QueueGuard>>;

    /// A subscription finished initialising
    fn add_replica(&self, subscription: &ReplicatingSubscription);

    /// A subscription caught up. Called at most once per subscription.
    fn ready_replica(&self, subscription: &ReplicatingSubscription);

    /// A subscription was cancelled
    fn remove_replica(&self, subscription: &ReplicatingSubscription);
}

/// (queue name, backup system id)
type ReplicaKey = (String, Uuid);

/// Registry entry for one replicating subscription
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub subscription: String,
    pub queue: String,
    pub broker: BrokerInfo,
    pub ready: bool,
    pub connected_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
}

/// Serialisable view of the primary's HA state
#[derive(Debug, Clone, Serialize)]
pub struct PrimaryStatus {
    pub broker: BrokerInfo,
    pub status: BrokerStatus,
    pub promoted_at: DateTime<Utc>,
    pub expected_backups: Vec<BrokerInfo>,
    /// "queue@broker" pairs still blocking recovery
    pub unready: Vec<String>,
    pub replicas: Vec<ReplicaStatus>,
    pub guards: usize,
}

struct PrimaryState {
    status: BrokerStatus,
    expected: HashMap<Uuid, BrokerInfo>,
    /// Expected backups that subscribed to at least one queue
    connected: HashSet<Uuid>,
    /// Expected (queue, backup) pairs not yet caught up
    unready: HashSet<ReplicaKey>,
    /// Guards created at promotion, not yet handed to a subscription
    guards: HashMap<ReplicaKey, Arc<QueueGuard>>,
    replicas: HashMap<ReplicaKey, ReplicaStatus>,
}

/// HA role of a broker that accepts and sequences messages.
///
/// A broker promoted after failover starts `Recovering`: every queue is
/// guarded for every backup it knew about, and it becomes `Active` once each
/// of those (queue, backup) pairs has caught up or the backup is given up on
/// by [`Primary::expire_expected_backups`].
pub struct Primary {
    info: BrokerInfo,
    config: HaConfig,
    promoted: Instant,
    promoted_at: DateTime<Utc>,
    state: RwLock<PrimaryState>,
}

impl Primary {
    /// Primary with no backups to wait for
    pub fn new(info: BrokerInfo, config: HaConfig) -> Arc<Self> {
        Self::promote(info, config, &[])
    }

    /// Promote to primary, guarding `queues` for each expected backup in
    /// `config`
    pub fn promote(info: BrokerInfo, config: HaConfig, queues: &[Arc<Queue>]) -> Arc<Self> {
        let expected: HashMap<Uuid, BrokerInfo> = config
            .expected_backups
            .iter()
            .filter(|b| b.system_id != info.system_id)
            .map(|b| (b.system_id, b.clone()))
            .collect();

        let mut guards = HashMap::new();
        for queue in queues {
            for backup in expected.values() {
                let key = (queue.name().to_string(), backup.system_id);
                guards.insert(key, QueueGuard::new(queue, backup));
            }
        }
        let unready: HashSet<ReplicaKey> = guards.keys().cloned().collect();

        let status = if unready.is_empty() {
            BrokerStatus::Active
        } else {
            BrokerStatus::Recovering
        };
        info!(
            "Promoted {} to primary: {} queues, {} expected backups, status {:?}",
            info,
            queues.len(),
            expected.len(),
            status
        );

        Arc::new(Self {
            info: info.with_status(status),
            config,
            promoted: Instant::now(),
            promoted_at: Utc::now(),
            state: RwLock::new(PrimaryState {
                status,
                expected,
                connected: HashSet::new(),
                unready,
                guards,
                replicas: HashMap::new(),
            }),
        })
    }

    pub fn info(&self) -> &BrokerInfo {
        &self.info
    }

    pub fn broker_status(&self) -> BrokerStatus {
        self.state.read().status
    }

    pub fn is_active(&self) -> bool {
        self.broker_status() == BrokerStatus::Active
    }

    /// Give up on expected backups that have not connected within the
    /// configured timeout. Returns the backups dropped.
    pub fn expire_expected_backups(&self) -> Vec<BrokerInfo> {
        if self.promoted.elapsed() < self.config.backup_timeout() {
            return Vec::new();
        }

        let (expired, guards) = {
            let mut state = self.state.write();
            let state = &mut *state;
            let expired: Vec<BrokerInfo> = state
                .expected
                .values()
                .filter(|b| !state.connected.contains(&b.system_id))
                .cloned()
                .collect();
            if expired.is_empty() {
                return expired;
            }

            let gone: HashSet<Uuid> = expired.iter().map(|b| b.system_id).collect();
            for id in &gone {
                state.expected.remove(id);
            }
            state.unready.retain(|(_, id)| !gone.contains(id));
            let keys: Vec<ReplicaKey> = state
                .guards
                .keys()
                .filter(|(_, id)| gone.contains(id))
                .cloned()
                .collect();
            let guards: Vec<Arc<QueueGuard>> = keys
                .iter()
                .filter_map(|key| state.guards.remove(key))
                .collect();
            Self::check_active(&self.info, state);
            (expired, guards)
        };

        for backup in &expired {
            warn!("Expected backup {} timed out", backup);
        }
        for guard in guards {
            guard.cancel();
        }
        expired
    }

    pub fn replicas(&self) -> Vec<ReplicaStatus> {
        self.state.read().replicas.values().cloned().collect()
    }

    pub fn status(&self) -> PrimaryStatus {
        let state = self.state.read();
        let mut unready: Vec<String> = state
            .unready
            .iter()
            .map(|(queue, id)| match state.expected.get(id) {
                Some(b) => format!("{}@{}", queue, b),
                None => format!("{}@{}", queue, id),
            })
            .collect();
        unready.sort();
        let mut replicas: Vec<ReplicaStatus> = state.replicas.values().cloned().collect();
        replicas.sort_by(|a, b| a.subscription.cmp(&b.subscription));

        PrimaryStatus {
            broker: self.info.clone().with_status(state.status),
            status: state.status,
            promoted_at: self.promoted_at,
            expected_backups: state.expected.values().cloned().collect(),
            unready,
            replicas,
            guards: state.guards.len(),
        }
    }

    fn key(subscription: &ReplicatingSubscription) -> Option<(ReplicaKey, BrokerInfo)> {
        let broker = subscription.broker_info()?;
        Some((
            (subscription.queue().name().to_string(), broker.system_id),
            broker.clone(),
        ))
    }

    fn check_active(info: &BrokerInfo, state: &mut PrimaryState) {
        if state.status == BrokerStatus::Recovering && state.unready.is_empty() {
            state.status = BrokerStatus::Active;
            info!("{} all backups ready, primary active", info);
        }
    }
}

impl RoleManager for Primary {
    fn get_guard(&self, queue: &Arc<Queue>, broker: &BrokerInfo) -> Option<Arc<QueueGuard>> {
        let key = (queue.name().to_string(), broker.system_id);
        self.state
            .write()
            .guards
            .remove(&key)
            .filter(|guard| !guard.is_cancelled())
    }

    fn add_replica(&self, subscription: &ReplicatingSubscription) {
        let Some((key, broker)) = Self::key(subscription) else {
            return;
        };
        let ready = subscription.is_ready();
        let now = Utc::now();

        let mut state = self.state.write();
        state.connected.insert(broker.system_id);
        debug!("Replica {} added on {}", broker, key.0);
        state.replicas.insert(
            key.clone(),
            ReplicaStatus {
                subscription: subscription.name().to_string(),
                queue: key.0,
                broker,
                ready,
                connected_at: now,
                ready_at: ready.then_some(now),
            },
        );
    }

    fn ready_replica(&self, subscription: &ReplicatingSubscription) {
        let Some((key, broker)) = Self::key(subscription) else {
            return;
        };

        let mut state = self.state.write();
        if let Some(replica) = state.replicas.get_mut(&key) {
            if replica.subscription == subscription.name() {
                replica.ready = true;
                replica.ready_at = Some(Utc::now());
            }
        }
        if state.unready.remove(&key) {
            info!("Expected backup {} ready on {}", broker, key.0);
            Self::check_active(&self.info, &mut state);
        }
    }

    fn remove_replica(&self, subscription: &ReplicatingSubscription) {
        let Some((key, broker)) = Self::key(subscription) else {
            return;
        };

        let mut state = self.state.write();
        // A newer subscription from the same backup may have replaced this one
        let current = state
            .replicas
            .get(&key)
            .is_some_and(|r| r.subscription == subscription.name());
        if current {
            state.replicas.remove(&key);
            debug!("Replica {} removed from {}", broker, key.0);
        }
    }
}
