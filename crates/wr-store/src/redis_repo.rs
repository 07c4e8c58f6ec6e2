//! Redis Streams implementation of the repository traits.
//!
//! Event records are written to their hash before the stream entry is
//! appended, so a consumer never observes an entry without a record; if a
//! record has nonetheless expired by consume time, the entry is acked and
//! skipped with a warning rather than poisoning the group.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use wr_common::{
    DeliveryMode, Event, EventReader, EventStatus, EventWriter, RelayError, Result,
    StreamConsumer, WorkerHeartbeat, WorkerRegistry,
};

use crate::keys::{group_name, hash_key, heartbeat_key, heartbeat_pattern, msgid_key, stream_key};

/// How long a consumed entry's stream message handle is kept around for the
/// eventual acknowledge.
const MSGID_TTL_SECS: u64 = 24 * 3600;

/// Heartbeat keys expire after this long without a refresh.
const HEARTBEAT_TTL_SECS: u64 = 60;

/// How long a consume blocks waiting for a new entry.
const CONSUME_BLOCK_MS: usize = 1000;

pub struct RedisRepository {
    conn: MultiplexedConnection,
}

impl RedisRepository {
    /// Connect and ping the server.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RelayError::Store(format!("opening redis client: {e}")))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RelayError::Store(format!("connecting to redis: {e}")))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| RelayError::Store(format!("pinging redis: {e}")))?;

        Ok(Self { conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// A handle to the underlying connection, for read-only collaborators
    /// like the metrics collector.
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn();
        match conn
            .xgroup_create_mkstream::<_, _, _, String>(stream, group, "0")
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RelayError::Store(format!("creating consumer group: {e}"))),
        }
    }

    /// Record the stream handle for a claimed entry and load its event.
    ///
    /// Entries whose record has gone missing are acked and skipped.
    async fn resolve_entry(
        &self,
        stream: &str,
        group: &str,
        entry: &StreamId,
    ) -> Result<Option<Event>> {
        let event_id = match entry.map.get("event_id") {
            Some(value) => redis::from_redis_value::<String>(value)
                .map_err(|e| RelayError::Store(format!("decoding event_id: {e}")))?,
            None => {
                warn!(stream_id = %entry.id, stream, "Stream entry without event_id, acking");
                self.ack_entry(stream, group, &entry.id).await?;
                return Ok(None);
            }
        };

        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(msgid_key(&event_id), &entry.id, MSGID_TTL_SECS)
            .await
            .map_err(|e| RelayError::Store(format!("recording message id: {e}")))?;

        match self.get(&event_id).await {
            Ok(event) => Ok(Some(event)),
            Err(RelayError::NotFound(_)) => {
                warn!(
                    event_id = %event_id,
                    stream_id = %entry.id,
                    "Event record missing for stream entry, acking and skipping"
                );
                self.ack_entry(stream, group, &entry.id).await?;
                let _ = self.delete_message_id(&event_id).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn ack_entry(&self, stream: &str, group: &str, stream_id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.xack::<_, _, _, i64>(stream, group, &[stream_id])
            .await
            .map_err(|e| RelayError::Store(format!("acknowledging message: {e}")))?;
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: &str,
        block: bool,
    ) -> Result<Vec<StreamId>> {
        let mut options = StreamReadOptions::default().group(group, consumer).count(1);
        if block {
            options = options.block(CONSUME_BLOCK_MS);
        }

        let mut conn = self.conn();
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[start], &options)
            .await
            .map_err(|e| RelayError::Store(format!("reading from stream: {e}")))?;

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .collect())
    }

    async fn touch_updated_at(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(hash_key(id), "updated_at", Utc::now().timestamp())
            .await
            .map_err(|e| RelayError::Store(format!("updating timestamp: {e}")))?;
        Ok(())
    }

    async fn scan_heartbeats(&self, pattern: String) -> Result<Vec<WorkerHeartbeat>> {
        let mut scan_conn = self.conn();
        let keys: Vec<String> = {
            let mut iter = scan_conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(|e| RelayError::Store(format!("scanning worker keys: {e}")))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut conn = self.conn();
        let mut workers = Vec::with_capacity(keys.len());
        for key in keys {
            // The key may expire between scan and get.
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| RelayError::Store(format!("getting worker heartbeat: {e}")))?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<WorkerHeartbeat>(&raw) {
                Ok(heartbeat) => workers.push(heartbeat),
                Err(e) => debug!(key, error = %e, "Skipping unparsable heartbeat"),
            }
        }

        Ok(workers)
    }
}

#[async_trait]
impl EventReader for RedisRepository {
    async fn get(&self, id: &str) -> Result<Event> {
        let mut conn = self.conn();
        let data: HashMap<String, String> = conn
            .hgetall(hash_key(id))
            .await
            .map_err(|e| RelayError::Store(format!("getting event: {e}")))?;

        if data.is_empty() {
            return Err(RelayError::NotFound(id.to_string()));
        }

        event_from_hash(id, data)
    }
}

#[async_trait]
impl EventWriter for RedisRepository {
    async fn store(&self, event: Event) -> Result<String> {
        let headers_json = serde_json::to_string(&event.headers)?;

        // Record first, stream entry second.
        let fields: Vec<(&str, Vec<u8>)> = vec![
            ("id", event.id.clone().into_bytes()),
            ("route_id", event.route_id.clone().into_bytes()),
            ("payload", event.payload.clone()),
            ("headers", headers_json.clone().into_bytes()),
            ("status", event.status.to_string().into_bytes()),
            ("retry_count", event.retry_count.to_string().into_bytes()),
            ("max_retries", event.max_retries.to_string().into_bytes()),
            ("delivery_mode", event.delivery_mode.to_string().into_bytes()),
            ("created_at", event.created_at.timestamp().to_string().into_bytes()),
            ("updated_at", event.updated_at.timestamp().to_string().into_bytes()),
        ];
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(hash_key(&event.id), &fields)
            .await
            .map_err(|e| RelayError::Store(format!("storing event record: {e}")))?;

        let stream = stream_key(&event.route_id, event.delivery_mode);
        let group = group_name(&event.route_id);
        self.ensure_group(&stream, &group).await?;

        let entry: Vec<(&str, Vec<u8>)> = vec![
            ("event_id", event.id.clone().into_bytes()),
            ("route_id", event.route_id.clone().into_bytes()),
            ("payload", event.payload.clone()),
            ("headers", headers_json.into_bytes()),
        ];
        conn.xadd::<_, _, _, _, String>(&stream, "*", &entry)
            .await
            .map_err(|e| RelayError::Store(format!("adding to stream: {e}")))?;

        Ok(event.id)
    }

    async fn update_status(&self, id: &str, status: EventStatus) -> Result<()> {
        let fields: Vec<(&str, String)> = vec![
            ("status", status.to_string()),
            ("updated_at", Utc::now().timestamp().to_string()),
        ];
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(hash_key(id), &fields)
            .await
            .map_err(|e| RelayError::Store(format!("updating status: {e}")))?;
        Ok(())
    }

    async fn increment_retry(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.hincr::<_, _, _, i64>(hash_key(id), "retry_count", 1)
            .await
            .map_err(|e| RelayError::Store(format!("incrementing retry count: {e}")))?;
        self.touch_updated_at(id).await
    }

    async fn set_ttl(&self, id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        conn.expire::<_, ()>(hash_key(id), ttl.as_secs() as i64)
            .await
            .map_err(|e| RelayError::Store(format!("setting TTL on event: {e}")))?;
        Ok(())
    }

    async fn delete_message_id(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(msgid_key(id))
            .await
            .map_err(|e| RelayError::Store(format!("deleting message id: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl StreamConsumer for RedisRepository {
    async fn consume(
        &self,
        route_id: &str,
        mode: DeliveryMode,
        worker_id: &str,
    ) -> Result<Vec<Event>> {
        let stream = stream_key(route_id, mode);
        let group = group_name(route_id);
        self.ensure_group(&stream, &group).await?;

        // Entries this consumer claimed in a previous run stay pending until
        // acknowledged; drain those before reading new entries so a restart
        // picks up where it left off.
        let mut entries = self
            .read_group(&stream, &group, worker_id, "0", false)
            .await?;
        if entries.is_empty() {
            entries = self
                .read_group(&stream, &group, worker_id, ">", true)
                .await?;
        }

        let mut events = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(event) = self.resolve_entry(&stream, &group, entry).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn acknowledge(
        &self,
        route_id: &str,
        mode: DeliveryMode,
        event_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn();
        let stream_id: Option<String> = conn
            .get(msgid_key(event_id))
            .await
            .map_err(|e| RelayError::Store(format!("getting message id: {e}")))?;

        // Already acknowledged or expired: nothing to do.
        let Some(stream_id) = stream_id else {
            return Ok(());
        };

        let stream = stream_key(route_id, mode);
        let group = group_name(route_id);
        self.ack_entry(&stream, &group, &stream_id).await?;
        self.delete_message_id(event_id).await
    }
}

#[async_trait]
impl WorkerRegistry for RedisRepository {
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
        let raw = serde_json::to_string(&heartbeat)?;

        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(heartbeat_key(route_id, worker_id), raw, HEARTBEAT_TTL_SECS)
            .await
            .map_err(|e| RelayError::Store(format!("setting heartbeat: {e}")))?;
        Ok(())
    }

    async fn active_workers(&self, route_id: &str) -> Result<Vec<WorkerHeartbeat>> {
        self.scan_heartbeats(heartbeat_pattern(Some(route_id))).await
    }
}

fn event_from_hash(id: &str, data: HashMap<String, String>) -> Result<Event> {
    let field = |name: &str| data.get(name).cloned().unwrap_or_default();

    let headers: HashMap<String, String> = match data.get("headers") {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
        _ => HashMap::new(),
    };

    let parse_ts = |name: &str| -> DateTime<Utc> {
        let secs = field(name).parse::<i64>().unwrap_or_default();
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    };

    Ok(Event {
        id: field("id"),
        route_id: field("route_id"),
        payload: field("payload").into_bytes(),
        headers,
        status: EventStatus::from_str(&field("status")).unwrap_or(EventStatus::Pending),
        retry_count: field("retry_count").parse().unwrap_or_default(),
        max_retries: field("max_retries").parse().unwrap_or_default(),
        delivery_mode: DeliveryMode::from_str(&field("delivery_mode"))
            .unwrap_or(DeliveryMode::Fifo),
        created_at: parse_ts("created_at"),
        updated_at: parse_ts("updated_at"),
    })
    .map(|mut event| {
        if event.id.is_empty() {
            event.id = id.to_string();
        }
        event
    })
}
