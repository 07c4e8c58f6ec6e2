//! Outbound delivery.
//!
//! Workers hand a fully built request to a [`Deliverer`]; the production
//! implementation posts it with a bounded-timeout reqwest client, tests
//! substitute a scripted one.

use std::time::Duration;

use async_trait::async_trait;
use wr_common::{RelayError, Result};

/// A fully prepared outbound POST.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// What came back from one delivery attempt.
#[derive(Debug, Clone)]
pub enum DeliveryResponse {
    /// The target answered with this HTTP status.
    Status(u16),
    /// The request never produced a response (connect, DNS, timeout).
    Transport(String),
}

#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, request: OutboundRequest) -> DeliveryResponse;
}

/// HTTP deliverer configuration.
#[derive(Debug, Clone)]
pub struct HttpDelivererConfig {
    pub connect_timeout: Duration,
    /// Bound on the whole attempt; a slower target counts as a transport
    /// failure and is retried.
    pub request_timeout: Duration,
}

impl Default for HttpDelivererConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpDeliverer {
    client: reqwest::Client,
}

impl HttpDeliverer {
    pub fn new(config: HttpDelivererConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Delivery(format!("building http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, request: OutboundRequest) -> DeliveryResponse {
        let mut builder = self.client.post(&request.url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) => DeliveryResponse::Status(response.status().as_u16()),
            Err(e) => DeliveryResponse::Transport(e.to_string()),
        }
    }
}
