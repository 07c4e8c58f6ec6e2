//! The per-route worker pool.
//!
//! One task per worker slot; FIFO routes get exactly one. Workers refresh a
//! 60 s heartbeat every 30 s, block briefly on the stream, and translate each
//! delivery outcome into a status transition. A retriable failure is retried
//! in place — the stream entry stays claimed and unacked — so a FIFO route
//! never advances past a struggling event.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use wr_common::{AppConfig, Event, EventStatus, Repository};
use wr_payload::Envelope;
use wr_routes::{Route, RouteRegistry};
use wr_signature::{build_signature_header, sign};

use crate::classify::{classify, Verdict};
use crate::deliver::{Deliverer, DeliveryResponse, OutboundRequest};

/// Tuning knobs for the pool; defaults match production behavior.
#[derive(Debug, Clone)]
pub struct DeliveryPoolConfig {
    /// Heartbeat refresh cadence (keys carry a 60 s TTL).
    pub heartbeat_interval: Duration,
    /// Pause between consume attempts when the stream is empty.
    pub idle_delay: Duration,
    /// Pause before retrying a failed consume (store unreachable).
    pub consume_retry_delay: Duration,
    /// Hard ceiling on a single backoff sleep, whatever the expression says.
    pub backoff_ceiling: Duration,
    /// Relative jitter applied to each backoff sleep (0.2 = ±20 %).
    pub backoff_jitter: f64,
}

impl Default for DeliveryPoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_delay: Duration::from_millis(100),
            consume_retry_delay: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(300),
            backoff_jitter: 0.2,
        }
    }
}

/// Running workers for every configured route.
pub struct DeliveryPool {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl DeliveryPool {
    /// Spawn `parallelism` workers per route.
    pub fn start(
        repo: Arc<dyn Repository>,
        registry: &RouteRegistry,
        deliverer: Arc<dyn Deliverer>,
        app_config: AppConfig,
        config: DeliveryPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let app_config = Arc::new(app_config);
        let mut handles = Vec::new();

        for route in registry.list() {
            for index in 0..route.parallelism {
                // Stable consumer names let a restarted worker drain the
                // entries it still had claimed in the group.
                let worker = RouteWorker {
                    worker_id: format!("worker-{index}"),
                    route: route.clone(),
                    repo: repo.clone(),
                    deliverer: deliverer.clone(),
                    app_config: app_config.clone(),
                    config: config.clone(),
                };
                handles.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
            }
            info!(
                route_id = %route.route_id,
                mode = %route.mode,
                parallelism = route.parallelism,
                "Started route workers"
            );
        }

        Self {
            shutdown_tx,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for them to finish their in-flight
    /// deliveries. Unacked events stay claim-pending for the next start.
    pub async fn shutdown(self) {
        info!("Delivery pool shutting down");
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task failed to join");
            }
        }
        info!("Delivery pool stopped");
    }
}

struct RouteWorker {
    worker_id: String,
    route: Route,
    repo: Arc<dyn Repository>,
    deliverer: Arc<dyn Deliverer>,
    app_config: Arc<AppConfig>,
    config: DeliveryPoolConfig,
}

impl RouteWorker {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            worker_id = %self.worker_id,
            route_id = %self.route.route_id,
            "Delivery worker started"
        );

        let mut last_heartbeat: Option<Instant> = None;

        loop {
            self.maybe_heartbeat("idle", &mut last_heartbeat).await;

            let consumed = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = self.repo.consume(&self.route.route_id, self.route.mode, &self.worker_id) => result,
            };

            let batch = match consumed {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        route_id = %self.route.route_id,
                        error = %e,
                        "Consume failed, backing off"
                    );
                    if wait_or_shutdown(self.config.consume_retry_delay, &mut shutdown_rx)
                        .await
                        .is_break()
                    {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if wait_or_shutdown(self.config.idle_delay, &mut shutdown_rx)
                    .await
                    .is_break()
                {
                    break;
                }
                continue;
            }

            for event in batch {
                if self
                    .handle_event(event, &mut shutdown_rx, &mut last_heartbeat)
                    .await
                    .is_break()
                {
                    info!(
                        worker_id = %self.worker_id,
                        "Shutdown during backoff, leaving event claim-pending"
                    );
                    return;
                }
            }
        }

        debug!(
            worker_id = %self.worker_id,
            route_id = %self.route.route_id,
            "Delivery worker stopped"
        );
    }

    /// Refresh the heartbeat key when the interval has elapsed.
    async fn maybe_heartbeat(&self, status: &str, last: &mut Option<Instant>) {
        if last.map_or(true, |at| at.elapsed() >= self.config.heartbeat_interval) {
            if let Err(e) = self
                .repo
                .set_worker_heartbeat(&self.worker_id, &self.route.route_id, status)
                .await
            {
                warn!(worker_id = %self.worker_id, error = %e, "Heartbeat refresh failed");
            }
            *last = Some(Instant::now());
        }
    }

    /// Drive one event to a terminal state, or break on shutdown.
    async fn handle_event(
        &self,
        event: Event,
        shutdown_rx: &mut broadcast::Receiver<()>,
        last_heartbeat: &mut Option<Instant>,
    ) -> ControlFlow<()> {
        if !self.route.event_types.is_empty() {
            match Envelope::parse(&event.payload) {
                Ok(envelope) => {
                    if !envelope.matches_event_type(&self.route.event_types) {
                        debug!(
                            event_id = %event.id,
                            event_type = %envelope.event_type,
                            "Event filtered out, completing without delivery"
                        );
                        self.finish(&event, EventStatus::Delivered).await;
                        return ControlFlow::Continue(());
                    }
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        error = %e,
                        "Stored payload failed validation, failing event"
                    );
                    self.finish(&event, EventStatus::Failed).await;
                    return ControlFlow::Continue(());
                }
            }
        }

        let mut retried = event.retry_count;
        loop {
            self.maybe_heartbeat("processing", last_heartbeat).await;
            self.try_update_status(&event.id, EventStatus::Delivering).await;

            match self.attempt(&event).await {
                Verdict::Success => {
                    debug!(event_id = %event.id, retry_count = retried, "Delivered");
                    self.finish(&event, EventStatus::Delivered).await;
                    return ControlFlow::Continue(());
                }
                Verdict::NonRetriable => {
                    warn!(event_id = %event.id, "Permanent delivery failure");
                    self.finish(&event, EventStatus::Failed).await;
                    return ControlFlow::Continue(());
                }
                Verdict::Retriable if retried >= event.max_retries => {
                    warn!(
                        event_id = %event.id,
                        retries = retried,
                        "Retries exhausted, failing event"
                    );
                    self.finish(&event, EventStatus::Failed).await;
                    return ControlFlow::Continue(());
                }
                Verdict::Retriable => {
                    let delay = self.backoff_delay(retried);
                    if let Err(e) = self.repo.increment_retry(&event.id).await {
                        warn!(event_id = %event.id, error = %e, "Retry increment failed");
                    }
                    retried += 1;
                    self.try_update_status(&event.id, EventStatus::Retrying).await;
                    debug!(
                        event_id = %event.id,
                        retry = retried,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    if self
                        .backoff_sleep(delay, shutdown_rx, last_heartbeat)
                        .await
                        .is_break()
                    {
                        return ControlFlow::Break(());
                    }
                }
            }
        }
    }

    /// One outbound POST, classified against the route's expectations.
    async fn attempt(&self, event: &Event) -> Verdict {
        let sent_at = Utc::now();
        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("webhook-id".to_string(), event.id.clone()),
            (
                "webhook-timestamp".to_string(),
                sent_at.timestamp().to_string(),
            ),
        ];

        if let Some(secret) = &self.route.signing_secret {
            match sign(secret, &event.id, sent_at, &event.payload) {
                Ok(signature) => headers.push((
                    "webhook-signature".to_string(),
                    build_signature_header(&[signature]),
                )),
                Err(e) => {
                    // A signature we cannot construct aborts the attempt; the
                    // event is retried rather than sent unsigned.
                    warn!(event_id = %event.id, error = %e, "Signing failed");
                    return Verdict::Retriable;
                }
            }
        }

        let response = self
            .deliverer
            .deliver(OutboundRequest {
                url: self.route.target_url.clone(),
                body: event.payload.clone(),
                headers,
            })
            .await;

        if let DeliveryResponse::Transport(reason) = &response {
            debug!(event_id = %event.id, reason, "Delivery transport failure");
        }

        classify(&response, self.route.expected_status)
    }

    /// Terminal transition: status, ack, aux-key cleanup, retention TTL.
    async fn finish(&self, event: &Event, status: EventStatus) {
        self.try_update_status(&event.id, status).await;

        if let Err(e) = self
            .repo
            .acknowledge(&self.route.route_id, self.route.mode, &event.id)
            .await
        {
            warn!(event_id = %event.id, error = %e, "Acknowledge failed");
        }
        if let Err(e) = self.repo.delete_message_id(&event.id).await {
            warn!(event_id = %event.id, error = %e, "Aux key cleanup failed");
        }

        let ttl = match status {
            EventStatus::Delivered => self.route.delivered_ttl(&self.app_config),
            _ => self.route.failed_ttl(&self.app_config),
        };
        if let Err(e) = self.repo.set_ttl(&event.id, ttl).await {
            warn!(event_id = %event.id, error = %e, "Retention TTL failed");
        }
    }

    async fn try_update_status(&self, id: &str, status: EventStatus) {
        if let Err(e) = self.repo.update_status(id, status).await {
            warn!(event_id = %id, status = %status, error = %e, "Status update failed");
        }
    }

    /// Sleep out a backoff in heartbeat-sized chunks so the worker's liveness
    /// key stays fresh through long waits.
    async fn backoff_sleep(
        &self,
        delay: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
        last_heartbeat: &mut Option<Instant>,
    ) -> ControlFlow<()> {
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return ControlFlow::Continue(());
            }
            let chunk = (deadline - now).min(self.config.heartbeat_interval);
            if wait_or_shutdown(chunk, shutdown_rx).await.is_break() {
                return ControlFlow::Break(());
            }
            self.maybe_heartbeat("processing", last_heartbeat).await;
        }
    }

    /// Evaluate the route's backoff for the number of retries already made,
    /// apply jitter, and clamp to the ceiling.
    fn backoff_delay(&self, retried: u32) -> Duration {
        let base_ms = self.route.retry_backoff.eval_ms(retried);
        let jitter = self.config.backoff_jitter;
        let factor = 1.0 + jitter * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        let jittered = (base_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(jittered).min(self.config.backoff_ceiling)
    }
}

async fn wait_or_shutdown(
    delay: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> ControlFlow<()> {
    tokio::select! {
        _ = shutdown_rx.recv() => ControlFlow::Break(()),
        _ = sleep(delay) => ControlFlow::Continue(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wr_routes::BackoffExpr;

    #[test]
    fn jitter_stays_within_bounds() {
        let worker_config = DeliveryPoolConfig::default();
        let expr = BackoffExpr::parse("1000").unwrap();

        for _ in 0..200 {
            let base_ms = expr.eval_ms(0);
            let factor =
                1.0 + worker_config.backoff_jitter * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
            let jittered = (base_ms as f64 * factor).round() as u64;
            assert!((800..=1200).contains(&jittered), "jittered = {jittered}");
        }
    }

    #[test]
    fn ceiling_caps_runaway_expressions() {
        let config = DeliveryPoolConfig::default();
        let expr = BackoffExpr::parse("pow(10, retried) * 1000").unwrap();

        let base_ms = expr.eval_ms(9);
        let capped = Duration::from_millis(base_ms).min(config.backoff_ceiling);
        assert_eq!(capped, config.backoff_ceiling);
    }
}
