use super::error::{BrokerError, Result};
use super::queue::{Queue, QueueStats};
use super::types::{Message, ReplicationId};
use crate::replication::QueueSnapshot;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Queue manager (manages multiple queues)
#[derive(Clone, Default)]
pub struct QueueManager {
    queues: Arc<RwLock<HashMap<String, Arc<Queue>>>>,
}

impl QueueManager {
    /// Create new queue manager
    pub fn new() -> Self {
        info!("Initializing Queue Manager");
        Self::default()
    }

    /// Create or get queue
    pub async fn create_queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.create_queue_from(name, 1).await
    }

    /// Create or get queue; a new queue continues replication ids at `next_id`
    pub async fn create_queue_from(&self, name: &str, next_id: ReplicationId) -> Result<Arc<Queue>> {
        if name.is_empty() {
            return Err(BrokerError::InvalidRequest("queue name is empty".to_string()));
        }

        let mut queues = self.queues.write();
        let queue = queues.entry(name.to_string()).or_insert_with(|| {
            let queue = Queue::with_next_id(name, next_id);
            QueueSnapshot::attach(&queue);
            queue
        });
        Ok(Arc::clone(queue))
    }

    /// Look up a queue
    pub fn get(&self, queue_name: &str) -> Result<Arc<Queue>> {
        self.queues
            .read()
            .get(queue_name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))
    }

    /// All queues, for guarding at promotion
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.read().values().cloned().collect()
    }

    /// Publish message to queue
    pub async fn publish(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<Message> {
        debug!("Publishing to queue: {}", queue_name);
        self.get(queue_name)?.publish(payload, headers)
    }

    /// Consume message from queue
    pub async fn consume(&self, queue_name: &str, consumer_id: &str) -> Result<Option<Message>> {
        debug!("Consuming from queue: {}", queue_name);
        Ok(self.get(queue_name)?.acquire(consumer_id))
    }

    /// Acknowledge message
    pub async fn ack(&self, queue_name: &str, id: ReplicationId) -> Result<()> {
        debug!("ACK message: {} in queue: {}", id, queue_name);
        self.get(queue_name)?
            .dequeue(id)
            .map(|_| ())
            .ok_or_else(|| BrokerError::MessageNotFound(format!("{}[{}]", queue_name, id)))
    }

    /// Negative acknowledge message
    pub async fn nack(&self, queue_name: &str, id: ReplicationId, requeue: bool) -> Result<()> {
        debug!(
            "NACK message: {} in queue: {}, requeue: {}",
            id, queue_name, requeue
        );
        let queue = self.get(queue_name)?;
        let found = if requeue {
            queue.release(id)
        } else {
            queue.dequeue(id).is_some()
        };
        if found {
            Ok(())
        } else {
            Err(BrokerError::MessageNotFound(format!("{}[{}]", queue_name, id)))
        }
    }

    /// Get queue statistics
    pub async fn stats(&self, queue_name: &str) -> Result<QueueStats> {
        Ok(self.get(queue_name)?.stats())
    }

    /// List all queues
    pub async fn list_queues(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Purge queue (remove all messages)
    pub async fn purge(&self, queue_name: &str) -> Result<usize> {
        debug!("Purging queue: {}", queue_name);
        Ok(self.get(queue_name)?.purge())
    }

    /// Delete queue
    pub async fn delete_queue(&self, queue_name: &str) -> Result<bool> {
        debug!("Deleting queue: {}", queue_name);
        let removed = self.queues.write().remove(queue_name);
        match removed {
            Some(queue) => {
                queue.destroy();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_publish_consume() {
        let manager = QueueManager::new();
        manager.create_queue("test_queue").await.unwrap();

        let msg = manager
            .publish("test_queue", b"Hello".to_vec(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(msg.replication_id, 1);

        let message = manager.consume("test_queue", "consumer1").await.unwrap();
        assert_eq!(message.unwrap().payload, b"Hello");
        assert!(manager.consume("test_queue", "consumer1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_attaches_snapshot() {
        let manager = QueueManager::new();
        let queue = manager.create_queue("q").await.unwrap();
        assert!(queue.observers().find::<QueueSnapshot>().is_some());

        // Creating again returns the same queue
        let again = manager.create_queue("q").await.unwrap();
        assert!(Arc::ptr_eq(&queue, &again));
        assert_eq!(queue.observers().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_ack_nack() {
        let manager = QueueManager::new();
        manager.create_queue("ack_queue").await.unwrap();
        let msg = manager
            .publish("ack_queue", b"Test".to_vec(), HashMap::new())
            .await
            .unwrap();
        let id = msg.replication_id;

        manager.consume("ack_queue", "c1").await.unwrap().unwrap();
        manager.nack("ack_queue", id, true).await.unwrap();

        // Back in the queue
        let again = manager.consume("ack_queue", "c1").await.unwrap().unwrap();
        assert_eq!(again.replication_id, id);

        assert!(manager.ack("ack_queue", id).await.is_ok());
        // Second ACK should fail
        assert!(matches!(
            manager.ack("ack_queue", id).await,
            Err(BrokerError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_continues_id_sequence() {
        let manager = QueueManager::new();
        manager.create_queue_from("q", 100).await.unwrap();
        let msg = manager
            .publish("q", b"x".to_vec(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(msg.replication_id, 100);
    }

    #[tokio::test]
    async fn test_stats_purge_delete() {
        let manager = QueueManager::new();
        let queue = manager.create_queue("q").await.unwrap();
        for _ in 0..3 {
            manager
                .publish("q", b"x".to_vec(), HashMap::new())
                .await
                .unwrap();
        }
        assert_eq!(manager.stats("q").await.unwrap().depth, 3);
        assert_eq!(manager.purge("q").await.unwrap(), 3);
        assert_eq!(manager.stats("q").await.unwrap().dequeued, 3);

        assert!(manager.delete_queue("q").await.unwrap());
        assert!(!manager.delete_queue("q").await.unwrap());
        assert!(queue.is_deleted());
        assert!(queue.observers().find::<QueueSnapshot>().is_none());
        assert!(matches!(
            manager.stats("q").await,
            Err(BrokerError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_queues() {
        let manager = QueueManager::new();
        manager.create_queue("b").await.unwrap();
        manager.create_queue("a").await.unwrap();
        assert_eq!(manager.list_queues().await.unwrap(), vec!["a", "b"]);
        assert!(manager.create_queue("").await.is_err());
    }
}
