//! In-memory repository used by unit tests.
//!
//! Implements the same contract as the Redis store over plain maps: a queue
//! per `(mode, route)` stream, a claims map standing in for the consumer
//! group's pending set, and recorded TTLs instead of real expiry.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use wr_common::{
    DeliveryMode, Event, EventReader, EventStatus, EventWriter, RelayError, Result,
    StreamConsumer, WorkerHeartbeat, WorkerRegistry,
};

use crate::keys::{heartbeat_key, stream_key};

#[derive(Default)]
struct Inner {
    events: HashMap<String, Event>,
    queues: HashMap<String, VecDeque<String>>,
    /// event_id -> synthetic stream message id, while claimed and unacked.
    claims: HashMap<String, String>,
    ttls: HashMap<String, Duration>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
    next_msg_id: u64,
}

#[derive(Default)]
pub struct InMemoryRepository {
    inner: Mutex<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL recorded for an event, if any.
    pub fn ttl(&self, event_id: &str) -> Option<Duration> {
        self.inner.lock().ttls.get(event_id).copied()
    }

    /// Whether the event is still claimed and unacknowledged.
    pub fn is_claimed(&self, event_id: &str) -> bool {
        self.inner.lock().claims.contains_key(event_id)
    }

    /// Number of entries still queued for a route.
    pub fn queued(&self, route_id: &str, mode: DeliveryMode) -> usize {
        self.inner
            .lock()
            .queues
            .get(&stream_key(route_id, mode))
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl EventReader for InMemoryRepository {
    async fn get(&self, id: &str) -> Result<Event> {
        self.inner
            .lock()
            .events
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl EventWriter for InMemoryRepository {
    async fn store(&self, event: Event) -> Result<String> {
        let mut inner = self.inner.lock();
        let id = event.id.clone();
        let stream = stream_key(&event.route_id, event.delivery_mode);
        inner.events.insert(id.clone(), event);
        inner.queues.entry(stream).or_default().push_back(id.clone());
        Ok(id)
    }

    async fn update_status(&self, id: &str, status: EventStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        event.status = status;
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_retry(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        event.retry_count += 1;
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn set_ttl(&self, id: &str, ttl: Duration) -> Result<()> {
        self.inner.lock().ttls.insert(id.to_string(), ttl);
        Ok(())
    }

    async fn delete_message_id(&self, id: &str) -> Result<()> {
        self.inner.lock().claims.remove(id);
        Ok(())
    }
}

#[async_trait]
impl StreamConsumer for InMemoryRepository {
    async fn consume(
        &self,
        route_id: &str,
        mode: DeliveryMode,
        _worker_id: &str,
    ) -> Result<Vec<Event>> {
        let mut inner = self.inner.lock();
        let stream = stream_key(route_id, mode);

        let Some(id) = inner.queues.get_mut(&stream).and_then(VecDeque::pop_front) else {
            return Ok(Vec::new());
        };

        inner.next_msg_id += 1;
        let msg_id = format!("{}-0", inner.next_msg_id);
        inner.claims.insert(id.clone(), msg_id);

        match inner.events.get(&id) {
            Some(event) => Ok(vec![event.clone()]),
            // Record vanished: drop the claim, mirroring the ack-and-skip of
            // the Redis store.
            None => {
                inner.claims.remove(&id);
                Ok(Vec::new())
            }
        }
    }

    async fn acknowledge(
        &self,
        _route_id: &str,
        _mode: DeliveryMode,
        event_id: &str,
    ) -> Result<()> {
        // Missing claim means already acknowledged: a no-op.
        self.inner.lock().claims.remove(event_id);
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryRepository {
    async fn set_worker_heartbeat(
        &self,
        worker_id: &str,
        route_id: &str,
        status: &str,
    ) -> Result<()> {
        let heartbeat = WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            route_id: route_id.to_string(),
            status: status.to_string(),
            last_heartbeat: Utc::now(),
        };
        self.inner
            .lock()
            .heartbeats
            .insert(heartbeat_key(route_id, worker_id), heartbeat);
        Ok(())
    }

    async fn active_workers(&self, route_id: &str) -> Result<Vec<WorkerHeartbeat>> {
        Ok(self
            .inner
            .lock()
            .heartbeats
            .values()
            .filter(|hb| hb.route_id == route_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn event(route_id: &str, mode: DeliveryMode) -> Event {
        Event::new(route_id, mode, b"{}".to_vec(), StdHashMap::new(), 3)
    }

    #[tokio::test]
    async fn store_consume_acknowledge() {
        let repo = InMemoryRepository::new();
        let id = repo.store(event("orders", DeliveryMode::Fifo)).await.unwrap();

        let batch = repo.consume("orders", DeliveryMode::Fifo, "w0").await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert!(repo.is_claimed(&id));

        repo.acknowledge("orders", DeliveryMode::Fifo, &id).await.unwrap();
        assert!(!repo.is_claimed(&id));
    }

    #[tokio::test]
    async fn acknowledge_twice_is_noop() {
        let repo = InMemoryRepository::new();
        let id = repo.store(event("orders", DeliveryMode::Fifo)).await.unwrap();
        repo.consume("orders", DeliveryMode::Fifo, "w0").await.unwrap();

        repo.acknowledge("orders", DeliveryMode::Fifo, &id).await.unwrap();
        repo.acknowledge("orders", DeliveryMode::Fifo, &id).await.unwrap();
    }

    #[tokio::test]
    async fn consume_preserves_store_order() {
        let repo = InMemoryRepository::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(repo.store(event("orders", DeliveryMode::Fifo)).await.unwrap());
        }

        for expected in &ids {
            let batch = repo.consume("orders", DeliveryMode::Fifo, "w0").await.unwrap();
            assert_eq!(&batch[0].id, expected);
        }
        assert!(repo
            .consume("orders", DeliveryMode::Fifo, "w0")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn retry_and_status_updates() {
        let repo = InMemoryRepository::new();
        let id = repo.store(event("orders", DeliveryMode::Fifo)).await.unwrap();

        repo.increment_retry(&id).await.unwrap();
        repo.increment_retry(&id).await.unwrap();
        repo.update_status(&id, EventStatus::Retrying).await.unwrap();

        let stored = repo.get(&id).await.unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.status, EventStatus::Retrying);

        assert!(matches!(
            repo.get("missing").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn heartbeats_grouped_by_route() {
        let repo = InMemoryRepository::new();
        repo.set_worker_heartbeat("w0", "orders", "idle").await.unwrap();
        repo.set_worker_heartbeat("w1", "orders", "processing").await.unwrap();
        repo.set_worker_heartbeat("w0", "analytics", "idle").await.unwrap();

        assert_eq!(repo.active_workers("orders").await.unwrap().len(), 2);
        assert_eq!(repo.active_workers("analytics").await.unwrap().len(), 1);
        assert!(repo.active_workers("other").await.unwrap().is_empty());
    }
}
