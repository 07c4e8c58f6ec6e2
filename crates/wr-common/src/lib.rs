//! Shared domain types for the webhook relay.
//!
//! Everything that flows between the intake API, the store, and the delivery
//! workers lives here: the [`Event`] record, its [`EventStatus`] lifecycle,
//! the [`DeliveryMode`] of a route, the repository traits the store
//! implements, and the process-wide [`RelayError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod config;
pub mod repository;

pub use config::AppConfig;
pub use repository::{
    EventReader, EventWriter, Repository, StreamConsumer, WorkerRegistry,
};

// ============================================================================
// Event
// ============================================================================

/// A received webhook tracked through delivery.
///
/// Immutable once stored except for `status`, `retry_count` and `updated_at`,
/// which the delivery workers advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub route_id: String,
    /// Raw bytes of the validated envelope, delivered byte-for-byte.
    pub payload: Vec<u8>,
    /// Request headers captured at intake, first value per name.
    pub headers: HashMap<String, String>,
    pub status: EventStatus,
    pub retry_count: u32,
    /// Snapshot of the route's retry policy at intake.
    pub max_retries: u32,
    pub delivery_mode: DeliveryMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Build a fresh event in `Pending` state with a new id.
    pub fn new(
        route_id: impl Into<String>,
        delivery_mode: DeliveryMode,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            route_id: route_id.into(),
            payload,
            headers,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries,
            delivery_mode,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Delivery lifecycle of an event.
///
/// `Pending -> Delivering -> {Delivered | Failed | Retrying -> Delivering ...}`.
/// `Delivered` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Delivering,
    Delivered,
    Failed,
    Retrying,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Delivering,
        EventStatus::Delivered,
        EventStatus::Failed,
        EventStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Delivering => "delivering",
            EventStatus::Delivered => "delivered",
            EventStatus::Failed => "failed",
            EventStatus::Retrying => "retrying",
        }
    }

    /// True for terminal states.
    pub fn is_final(&self) -> bool {
        matches!(self, EventStatus::Delivered | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "delivering" => Ok(EventStatus::Delivering),
            "delivered" => Ok(EventStatus::Delivered),
            "failed" => Ok(EventStatus::Failed),
            "retrying" => Ok(EventStatus::Retrying),
            other => Err(RelayError::Validation(format!("invalid status: {other}"))),
        }
    }
}

// ============================================================================
// Delivery mode
// ============================================================================

/// How a route's events are handed to workers.
///
/// `Fifo` keeps strict ordering with a single worker; `PubSub` trades
/// ordering for throughput with `parallelism` workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Fifo,
    PubSub,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Fifo => "fifo",
            DeliveryMode::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(DeliveryMode::Fifo),
            "pubsub" => Ok(DeliveryMode::PubSub),
            other => Err(RelayError::Validation(format!(
                "invalid delivery mode: {other}"
            ))),
        }
    }
}

// ============================================================================
// Worker heartbeat
// ============================================================================

/// Liveness record written by each worker under a short-TTL key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub route_id: String,
    /// "idle" or "processing".
    pub status: String,
    pub last_heartbeat: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(String),

    #[error("event not found: {0}")]
    NotFound(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in EventStatus::ALL {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<EventStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(EventStatus::Delivered.is_final());
        assert!(EventStatus::Failed.is_final());
        assert!(!EventStatus::Pending.is_final());
        assert!(!EventStatus::Delivering.is_final());
        assert!(!EventStatus::Retrying.is_final());
    }

    #[test]
    fn delivery_mode_round_trips() {
        assert_eq!("fifo".parse::<DeliveryMode>().unwrap(), DeliveryMode::Fifo);
        assert_eq!(
            "pubsub".parse::<DeliveryMode>().unwrap(),
            DeliveryMode::PubSub
        );
        assert!("topic".parse::<DeliveryMode>().is_err());
    }

    #[test]
    fn new_event_starts_pending() {
        let event = Event::new(
            "orders",
            DeliveryMode::Fifo,
            b"{}".to_vec(),
            HashMap::new(),
            3,
        );
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.max_retries, 3);
        assert!(!event.id.is_empty());
    }
}
