//! Event store implementations.
//!
//! [`RedisRepository`] is the production store: Redis Streams for per-route
//! queues with consumer groups, hashes for event records, and plain keys for
//! the auxiliary message-id and heartbeat entries. [`InMemoryRepository`]
//! backs unit tests with the same contract and no external process.

mod keys;
mod memory;
mod redis_repo;

pub use keys::{group_name, hash_key, heartbeat_key, heartbeat_pattern, msgid_key, stream_key};
pub use memory::InMemoryRepository;
pub use redis_repo::RedisRepository;
