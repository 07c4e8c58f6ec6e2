//! Observable metrics over the event store.
//!
//! Everything is computed on scrape: stream lengths per route, event counts
//! by status, delivered throughput over 1/5/15-minute windows, and live
//! workers per route from their heartbeat keys. [`render_prometheus`] turns a
//! snapshot into exposition text for the `/metrics` endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::debug;

use wr_common::{RelayError, Result, WorkerHeartbeat};
use wr_routes::RouteRegistry;
use wr_store::{heartbeat_pattern, stream_key};

/// SCAN pattern covering event records (and their aux keys, filtered below).
const EVENT_KEY_PATTERN: &str = "webhook:*";
const MSGID_SUFFIX: &str = ":msgid";
const SCAN_COUNT: usize = 1000;

/// A point-in-time snapshot of the relay.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// route_id -> entries currently in the stream.
    pub queue_lengths: HashMap<String, i64>,
    /// status name -> event count.
    pub status_counts: HashMap<String, i64>,
    pub throughput: ThroughputMetrics,
    /// route_id -> live workers.
    pub workers: HashMap<String, Vec<WorkerHeartbeat>>,
    pub timestamp: DateTime<Utc>,
}

/// Events delivered over trailing windows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThroughputMetrics {
    pub last_minute: i64,
    pub last_five_minutes: i64,
    pub last_fifteen_minutes: i64,
}

/// Metric collection over the store.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self) -> Result<Metrics>;
    async fn queue_lengths(&self) -> Result<HashMap<String, i64>>;
    async fn status_counts(&self) -> Result<HashMap<String, i64>>;
    async fn throughput(&self) -> Result<ThroughputMetrics>;
    async fn active_workers(&self) -> Result<HashMap<String, Vec<WorkerHeartbeat>>>;
}

pub struct RedisCollector {
    conn: MultiplexedConnection,
    registry: Arc<RouteRegistry>,
}

impl RedisCollector {
    pub fn new(conn: MultiplexedConnection, registry: Arc<RouteRegistry>) -> Self {
        Self { conn, registry }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(|e| RelayError::Store(format!("scanning keys: {e}")))?;

        let mut keys = Vec::with_capacity(SCAN_COUNT);
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn event_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .scan_keys(EVENT_KEY_PATTERN)
            .await?
            .into_iter()
            .filter(|key| !key.ends_with(MSGID_SUFFIX))
            .collect())
    }
}

#[async_trait]
impl Collector for RedisCollector {
    async fn collect(&self) -> Result<Metrics> {
        Ok(Metrics {
            queue_lengths: self.queue_lengths().await?,
            status_counts: self.status_counts().await?,
            throughput: self.throughput().await?,
            workers: self.active_workers().await?,
            timestamp: Utc::now(),
        })
    }

    async fn queue_lengths(&self) -> Result<HashMap<String, i64>> {
        let mut conn = self.conn.clone();
        let mut lengths = HashMap::new();

        for route in self.registry.list() {
            let key = stream_key(&route.route_id, route.mode);
            match conn.xlen::<_, i64>(&key).await {
                Ok(length) => {
                    lengths.insert(route.route_id.clone(), length);
                }
                // A route with no traffic yet has no stream; report zero and
                // keep going if one stream read fails.
                Err(e) => {
                    debug!(route_id = %route.route_id, error = %e, "Stream length unavailable");
                    lengths.insert(route.route_id.clone(), 0);
                }
            }
        }

        Ok(lengths)
    }

    async fn status_counts(&self) -> Result<HashMap<String, i64>> {
        let mut counts: HashMap<String, i64> = wr_common::EventStatus::ALL
            .iter()
            .map(|status| (status.to_string(), 0))
            .collect();

        let mut conn = self.conn.clone();
        for key in self.event_keys().await? {
            let status: Option<String> = conn
                .hget(&key, "status")
                .await
                .map_err(|e| RelayError::Store(format!("reading event status: {e}")))?;
            if let Some(status) = status {
                if let Some(count) = counts.get_mut(&status) {
                    *count += 1;
                }
            }
        }

        Ok(counts)
    }

    async fn throughput(&self) -> Result<ThroughputMetrics> {
        let now = Utc::now().timestamp();
        let one_minute_ago = now - 60;
        let five_minutes_ago = now - 5 * 60;
        let fifteen_minutes_ago = now - 15 * 60;

        let mut throughput = ThroughputMetrics::default();
        let mut conn = self.conn.clone();

        for key in self.event_keys().await? {
            let fields: Vec<Option<String>> = conn
                .hget(&key, vec!["status", "updated_at"])
                .await
                .map_err(|e| RelayError::Store(format!("reading event fields: {e}")))?;

            let (Some(status), Some(updated_at)) = (&fields[0], &fields[1]) else {
                continue;
            };
            if status != "delivered" {
                continue;
            }
            let Ok(updated_at) = updated_at.parse::<i64>() else {
                continue;
            };

            if updated_at >= fifteen_minutes_ago {
                throughput.last_fifteen_minutes += 1;
                if updated_at >= five_minutes_ago {
                    throughput.last_five_minutes += 1;
                    if updated_at >= one_minute_ago {
                        throughput.last_minute += 1;
                    }
                }
            }
        }

        Ok(throughput)
    }

    async fn active_workers(&self) -> Result<HashMap<String, Vec<WorkerHeartbeat>>> {
        let mut conn = self.conn.clone();
        let mut workers: HashMap<String, Vec<WorkerHeartbeat>> = HashMap::new();

        for key in self.scan_keys(&heartbeat_pattern(None)).await? {
            // The key may expire between scan and get.
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| RelayError::Store(format!("reading heartbeat: {e}")))?;
            let Some(raw) = raw else { continue };

            match serde_json::from_str::<WorkerHeartbeat>(&raw) {
                Ok(heartbeat) => workers
                    .entry(heartbeat.route_id.clone())
                    .or_default()
                    .push(heartbeat),
                Err(e) => debug!(key, error = %e, "Skipping unparsable heartbeat"),
            }
        }

        Ok(workers)
    }
}

/// Render a snapshot in Prometheus exposition format.
///
/// Label values are emitted in sorted order so scrapes are stable.
pub fn render_prometheus(metrics: &Metrics) -> String {
    let mut out = String::new();

    out.push_str("# HELP webhook_queue_length Entries currently in the route stream\n");
    out.push_str("# TYPE webhook_queue_length gauge\n");
    for (route_id, length) in sorted(&metrics.queue_lengths) {
        out.push_str(&format!(
            "webhook_queue_length{{route_id=\"{route_id}\"}} {length}\n"
        ));
    }

    out.push_str("# HELP webhook_status_count Events by delivery status\n");
    out.push_str("# TYPE webhook_status_count gauge\n");
    for (status, count) in sorted(&metrics.status_counts) {
        out.push_str(&format!(
            "webhook_status_count{{status=\"{status}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP webhook_delivered_throughput Events delivered within the trailing window\n");
    out.push_str("# TYPE webhook_delivered_throughput gauge\n");
    for (window, value) in [
        ("15m", metrics.throughput.last_fifteen_minutes),
        ("1m", metrics.throughput.last_minute),
        ("5m", metrics.throughput.last_five_minutes),
    ] {
        out.push_str(&format!(
            "webhook_delivered_throughput{{window=\"{window}\"}} {value}\n"
        ));
    }

    out.push_str("# HELP webhook_workers_active Workers with a live heartbeat\n");
    out.push_str("# TYPE webhook_workers_active gauge\n");
    let worker_counts: HashMap<String, i64> = metrics
        .workers
        .iter()
        .map(|(route_id, workers)| (route_id.clone(), workers.len() as i64))
        .collect();
    for (route_id, count) in sorted(&worker_counts) {
        out.push_str(&format!(
            "webhook_workers_active{{route_id=\"{route_id}\"}} {count}\n"
        ));
    }

    out
}

fn sorted(map: &HashMap<String, i64>) -> Vec<(&String, &i64)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(key, _)| key.as_str());
    entries
}
