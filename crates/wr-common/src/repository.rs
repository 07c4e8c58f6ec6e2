//! Repository traits the event store implements.
//!
//! Split into small, focused traits so callers depend only on the operations
//! they use: the intake handler needs [`EventWriter`], workers need the whole
//! [`Repository`], the metrics collector reads through its own scans.

use std::time::Duration;

use async_trait::async_trait;

use crate::{DeliveryMode, Event, EventStatus, Result, WorkerHeartbeat};

/// Read access to stored events.
#[async_trait]
pub trait EventReader: Send + Sync {
    /// Fetch an event by id, or `RelayError::NotFound`.
    async fn get(&self, id: &str) -> Result<Event>;
}

/// Write access to stored events.
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Persist the event record and append it to the route's stream.
    ///
    /// The consumer group for `(mode, route_id)` is created if missing. The
    /// record is written before the stream entry so a consumer never observes
    /// an entry without its backing record.
    async fn store(&self, event: Event) -> Result<String>;

    /// Overwrite the status and bump `updated_at`. Transition legality is the
    /// worker's responsibility, not the store's.
    async fn update_status(&self, id: &str, status: EventStatus) -> Result<()>;

    /// Atomically add one to `retry_count` and bump `updated_at`.
    async fn increment_retry(&self, id: &str) -> Result<()>;

    /// Expire the event record after `ttl`. Applied once an event reaches a
    /// terminal state.
    async fn set_ttl(&self, id: &str, ttl: Duration) -> Result<()>;

    /// Drop the auxiliary stream-message-id key. Idempotent.
    async fn delete_message_id(&self, id: &str) -> Result<()>;
}

/// Consuming events from a route's stream through its consumer group.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Claim up to one pending event for `worker_id`, blocking briefly when
    /// the stream is empty. Returns an empty vec on timeout.
    async fn consume(
        &self,
        route_id: &str,
        mode: DeliveryMode,
        worker_id: &str,
    ) -> Result<Vec<Event>>;

    /// Acknowledge a previously consumed event. A second acknowledge of the
    /// same event is a no-op.
    async fn acknowledge(
        &self,
        route_id: &str,
        mode: DeliveryMode,
        event_id: &str,
    ) -> Result<()>;
}

/// Worker liveness bookkeeping.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Refresh the worker's heartbeat key (60 s TTL).
    async fn set_worker_heartbeat(
        &self,
        worker_id: &str,
        route_id: &str,
        status: &str,
    ) -> Result<()>;

    /// Workers with a live heartbeat for one route.
    async fn active_workers(&self, route_id: &str) -> Result<Vec<WorkerHeartbeat>>;
}

/// The full store contract, composed from the focused traits.
pub trait Repository: EventReader + EventWriter + StreamConsumer + WorkerRegistry {}

impl<T> Repository for T where T: EventReader + EventWriter + StreamConsumer + WorkerRegistry {}
