//! Delivery worker pool.
//!
//! For every configured route the pool runs `parallelism` workers, each
//! looping `consume -> filter -> sign -> POST -> classify -> ack/retry/fail`
//! until shutdown. FIFO routes run a single worker that retries a failed
//! delivery before consuming the next entry, which is what makes ordering
//! hold end to end.

pub mod classify;
pub mod deliver;
pub mod pool;

pub use classify::{classify, Verdict};
pub use deliver::{
    Deliverer, DeliveryResponse, HttpDeliverer, HttpDelivererConfig, OutboundRequest,
};
pub use pool::{DeliveryPool, DeliveryPoolConfig};
