//! Key naming for the store.
//!
//! - stream: `webhooks:{mode}:{route_id}`
//! - consumer group: `webhook-workers-{route_id}`
//! - event record: `webhook:{event_id}`
//! - stream message handle: `webhook:{event_id}:msgid`
//! - worker liveness: `worker:heartbeat:{route_id}:{worker_id}`

use wr_common::DeliveryMode;

const STREAM_PREFIX: &str = "webhooks";
const HASH_PREFIX: &str = "webhook";
const CONSUMER_GROUP_PREFIX: &str = "webhook-workers";
const HEARTBEAT_PREFIX: &str = "worker:heartbeat";

pub fn stream_key(route_id: &str, mode: DeliveryMode) -> String {
    format!("{STREAM_PREFIX}:{mode}:{route_id}")
}

pub fn group_name(route_id: &str) -> String {
    format!("{CONSUMER_GROUP_PREFIX}-{route_id}")
}

pub fn hash_key(event_id: &str) -> String {
    format!("{HASH_PREFIX}:{event_id}")
}

pub fn msgid_key(event_id: &str) -> String {
    format!("{HASH_PREFIX}:{event_id}:msgid")
}

pub fn heartbeat_key(route_id: &str, worker_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}:{route_id}:{worker_id}")
}

/// SCAN pattern for heartbeats; `None` spans all routes.
pub fn heartbeat_pattern(route_id: Option<&str>) -> String {
    match route_id {
        Some(route_id) => format!("{HEARTBEAT_PREFIX}:{route_id}:*"),
        None => format!("{HEARTBEAT_PREFIX}:*"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(stream_key("orders", DeliveryMode::Fifo), "webhooks:fifo:orders");
        assert_eq!(
            stream_key("analytics", DeliveryMode::PubSub),
            "webhooks:pubsub:analytics"
        );
        assert_eq!(group_name("orders"), "webhook-workers-orders");
        assert_eq!(hash_key("abc"), "webhook:abc");
        assert_eq!(msgid_key("abc"), "webhook:abc:msgid");
        assert_eq!(heartbeat_key("orders", "w1"), "worker:heartbeat:orders:w1");
        assert_eq!(heartbeat_pattern(Some("orders")), "worker:heartbeat:orders:*");
        assert_eq!(heartbeat_pattern(None), "worker:heartbeat:*");
    }
}
