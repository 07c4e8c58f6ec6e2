//! Route configuration: the YAML loader and the immutable in-memory registry.
//!
//! Routes are loaded once at startup and never mutated afterwards, so lookups
//! need no locking. The loader validates everything eagerly — delivery mode,
//! parallelism, expected status, signing secret, event-type filters and the
//! retry backoff expression — so a bad routes file fails the process (or the
//! validator CLI) instead of the first delivery.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use wr_common::{AppConfig, DeliveryMode};
use wr_payload::PayloadError;
use wr_signature::{Secret, SignatureError};

pub mod backoff;

pub use backoff::{BackoffError, BackoffExpr};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("reading routes file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing routes YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("route_id cannot be empty")]
    EmptyRouteId,

    #[error("duplicate route_id: {0}")]
    DuplicateRouteId(String),

    #[error("target_url cannot be empty for route {0}")]
    EmptyTargetUrl(String),

    #[error("invalid mode '{mode}' for route {route_id}")]
    InvalidMode { route_id: String, mode: String },

    #[error("parallelism must be at least 1 for route {0}")]
    ZeroParallelism(String),

    #[error("fifo mode requires parallelism=1 for route {route_id} (got {got})")]
    FifoParallelism { route_id: String, got: u32 },

    #[error("expected_status must be 200, 201, or 202 for route {route_id} (got {got})")]
    InvalidExpectedStatus { route_id: String, got: u16 },

    #[error("retry_backoff cannot be empty for route {0}")]
    EmptyBackoff(String),

    #[error("invalid retry_backoff for route {route_id}: {source}")]
    InvalidBackoff {
        route_id: String,
        #[source]
        source: BackoffError,
    },

    #[error("invalid signing_secret for route {route_id}: {source}")]
    InvalidSecret {
        route_id: String,
        #[source]
        source: SignatureError,
    },

    #[error("invalid event_type '{pattern}' for route {route_id}: {source}")]
    InvalidEventType {
        route_id: String,
        pattern: String,
        #[source]
        source: PayloadError,
    },
}

/// Default expected HTTP status when a route omits it.
pub const DEFAULT_EXPECTED_STATUS: u16 = 202;

const ACCEPTED_EXPECTED_STATUSES: [u16; 3] = [200, 201, 202];

/// A webhook destination and its delivery policy. Read-only after load.
#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: String,
    pub target_url: String,
    pub mode: DeliveryMode,
    pub max_retries: u32,
    pub retry_backoff: BackoffExpr,
    pub parallelism: u32,
    /// When set, the only 2xx accepted as success; any other 2xx is then a
    /// misconfigured consumer. When omitted the whole 2xx range succeeds.
    pub expected_status: Option<u16>,
    pub delivered_ttl_hours: Option<u64>,
    pub failed_ttl_hours: Option<u64>,
    pub signing_secret: Option<Secret>,
    /// Event-type filter; empty accepts everything.
    pub event_types: Vec<String>,
}

impl Route {
    /// The expected status as listed to clients, defaulting to 202.
    pub fn listed_expected_status(&self) -> u16 {
        self.expected_status.unwrap_or(DEFAULT_EXPECTED_STATUS)
    }

    /// TTL for delivered events: route override, then config, defaulting to
    /// one hour.
    pub fn delivered_ttl(&self, config: &AppConfig) -> Duration {
        let hours = self
            .delivered_ttl_hours
            .unwrap_or(config.delivered_ttl_hours);
        Duration::from_secs(hours * 3600)
    }

    /// TTL for failed events: route override, then config, defaulting to 24
    /// hours.
    pub fn failed_ttl(&self, config: &AppConfig) -> Duration {
        let hours = self.failed_ttl_hours.unwrap_or(config.failed_ttl_hours);
        Duration::from_secs(hours * 3600)
    }
}

#[derive(Debug, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    #[serde(default)]
    route_id: String,
    #[serde(default)]
    target_url: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    retry_backoff: String,
    #[serde(default)]
    parallelism: u32,
    expected_status: Option<u16>,
    delivered_ttl_hours: Option<u64>,
    failed_ttl_hours: Option<u64>,
    signing_secret: Option<String>,
    #[serde(default)]
    event_types: Vec<String>,
}

impl RouteEntry {
    fn into_route(self) -> Result<Route, RouteError> {
        if self.route_id.is_empty() {
            return Err(RouteError::EmptyRouteId);
        }
        let route_id = self.route_id;

        if self.target_url.is_empty() {
            return Err(RouteError::EmptyTargetUrl(route_id));
        }

        let mode = DeliveryMode::from_str(&self.mode).map_err(|_| RouteError::InvalidMode {
            route_id: route_id.clone(),
            mode: self.mode.clone(),
        })?;

        if self.parallelism == 0 {
            return Err(RouteError::ZeroParallelism(route_id));
        }
        if mode == DeliveryMode::Fifo && self.parallelism > 1 {
            return Err(RouteError::FifoParallelism {
                route_id,
                got: self.parallelism,
            });
        }

        if let Some(expected_status) = self.expected_status {
            if !ACCEPTED_EXPECTED_STATUSES.contains(&expected_status) {
                return Err(RouteError::InvalidExpectedStatus {
                    route_id,
                    got: expected_status,
                });
            }
        }

        if self.retry_backoff.is_empty() {
            return Err(RouteError::EmptyBackoff(route_id));
        }
        let retry_backoff =
            BackoffExpr::parse(&self.retry_backoff).map_err(|source| RouteError::InvalidBackoff {
                route_id: route_id.clone(),
                source,
            })?;

        let signing_secret = self
            .signing_secret
            .as_deref()
            .map(Secret::parse)
            .transpose()
            .map_err(|source| RouteError::InvalidSecret {
                route_id: route_id.clone(),
                source,
            })?;

        for pattern in &self.event_types {
            wr_payload::validate_pattern(pattern).map_err(|source| {
                RouteError::InvalidEventType {
                    route_id: route_id.clone(),
                    pattern: pattern.clone(),
                    source,
                }
            })?;
        }

        Ok(Route {
            route_id,
            target_url: self.target_url,
            mode,
            max_retries: self.max_retries,
            retry_backoff,
            parallelism: self.parallelism,
            expected_status: self.expected_status,
            delivered_ttl_hours: self.delivered_ttl_hours,
            failed_ttl_hours: self.failed_ttl_hours,
            signing_secret,
            event_types: self.event_types,
        })
    }
}

/// Immutable index of all configured routes.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: HashMap<String, Route>,
}

impl RouteRegistry {
    /// Read and validate a routes.yaml file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouteError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RouteError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate routes from a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self, RouteError> {
        let file: RoutesFile = serde_yaml::from_str(raw)?;

        let mut routes = HashMap::with_capacity(file.routes.len());
        for entry in file.routes {
            let route = entry.into_route()?;
            if routes.contains_key(&route.route_id) {
                return Err(RouteError::DuplicateRouteId(route.route_id));
            }
            routes.insert(route.route_id.clone(), route);
        }

        Ok(Self { routes })
    }

    pub fn get(&self, route_id: &str) -> Option<&Route> {
        self.routes.get(route_id)
    }

    /// All routes, sorted by id for stable listings.
    pub fn list(&self) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self.routes.values().collect();
        routes.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn minimal_yaml() -> String {
        r#"
routes:
  - route_id: user-events
    target_url: http://localhost:9000/webhook
    mode: fifo
    max_retries: 3
    retry_backoff: "pow(2, retried) * 1000"
    parallelism: 1
"#
        .to_string()
    }

    #[test]
    fn loads_minimal_route_with_defaults() {
        let registry = RouteRegistry::from_yaml(&minimal_yaml()).unwrap();
        let route = registry.get("user-events").unwrap();

        assert_eq!(route.mode, DeliveryMode::Fifo);
        assert_eq!(route.expected_status, None);
        assert_eq!(route.listed_expected_status(), DEFAULT_EXPECTED_STATUS);
        assert!(route.signing_secret.is_none());
        assert!(route.event_types.is_empty());
        assert_eq!(route.retry_backoff.eval_ms(1), 2000);
    }

    #[test]
    fn full_route_parses() {
        let secret = format!("whsec_{}", BASE64.encode([0u8; 32]));
        let yaml = format!(
            r#"
routes:
  - route_id: analytics
    target_url: http://localhost:9000/analytics
    mode: pubsub
    max_retries: 5
    retry_backoff: "min(pow(2, retried) * 100, 30000)"
    parallelism: 5
    expected_status: 200
    delivered_ttl_hours: 2
    failed_ttl_hours: 48
    signing_secret: "{secret}"
    event_types:
      - "user.*"
      - "order.created"
"#
        );
        let registry = RouteRegistry::from_yaml(&yaml).unwrap();
        let route = registry.get("analytics").unwrap();

        assert_eq!(route.mode, DeliveryMode::PubSub);
        assert_eq!(route.parallelism, 5);
        assert_eq!(route.expected_status, Some(200));
        assert_eq!(route.delivered_ttl_hours, Some(2));
        assert!(route.signing_secret.is_some());
        assert_eq!(route.event_types.len(), 2);
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        let yaml = r#"
routes:
  - route_id: dup
    target_url: http://a
    mode: fifo
    retry_backoff: "1000"
    parallelism: 1
  - route_id: dup
    target_url: http://b
    mode: fifo
    retry_backoff: "1000"
    parallelism: 1
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::DuplicateRouteId(id)) if id == "dup"
        ));
    }

    #[test]
    fn rejects_fifo_with_parallelism() {
        let yaml = r#"
routes:
  - route_id: ordered
    target_url: http://a
    mode: fifo
    retry_backoff: "1000"
    parallelism: 4
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::FifoParallelism { got: 4, .. })
        ));
    }

    #[test]
    fn rejects_unknown_mode_and_zero_parallelism() {
        let yaml = r#"
routes:
  - route_id: r
    target_url: http://a
    mode: topic
    retry_backoff: "1000"
    parallelism: 1
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::InvalidMode { .. })
        ));

        let yaml = r#"
routes:
  - route_id: r
    target_url: http://a
    mode: pubsub
    retry_backoff: "1000"
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::ZeroParallelism(_))
        ));
    }

    #[test]
    fn rejects_bad_expected_status() {
        let yaml = r#"
routes:
  - route_id: r
    target_url: http://a
    mode: pubsub
    retry_backoff: "1000"
    parallelism: 1
    expected_status: 204
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::InvalidExpectedStatus { got: 204, .. })
        ));
    }

    #[test]
    fn rejects_bad_secret_backoff_and_patterns() {
        let yaml = r#"
routes:
  - route_id: r
    target_url: http://a
    mode: pubsub
    retry_backoff: "1000"
    parallelism: 1
    signing_secret: "whsec_tooshort"
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::InvalidSecret { .. })
        ));

        let yaml = r#"
routes:
  - route_id: r
    target_url: http://a
    mode: pubsub
    retry_backoff: "sleep(1000)"
    parallelism: 1
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::InvalidBackoff { .. })
        ));

        let yaml = r#"
routes:
  - route_id: r
    target_url: http://a
    mode: pubsub
    retry_backoff: "1000"
    parallelism: 1
    event_types: ["user..*"]
"#;
        assert!(matches!(
            RouteRegistry::from_yaml(yaml),
            Err(RouteError::InvalidEventType { .. })
        ));
    }

    #[test]
    fn ttl_precedence() {
        let config = AppConfig::default();
        let registry = RouteRegistry::from_yaml(&minimal_yaml()).unwrap();
        let route = registry.get("user-events").unwrap();

        // No route override: config defaults (1 h delivered, 24 h failed).
        assert_eq!(route.delivered_ttl(&config), Duration::from_secs(3600));
        assert_eq!(route.failed_ttl(&config), Duration::from_secs(24 * 3600));

        let mut overridden = route.clone();
        overridden.delivered_ttl_hours = Some(6);
        overridden.failed_ttl_hours = Some(72);
        assert_eq!(overridden.delivered_ttl(&config), Duration::from_secs(6 * 3600));
        assert_eq!(overridden.failed_ttl(&config), Duration::from_secs(72 * 3600));
    }

    #[test]
    fn list_is_sorted() {
        let yaml = r#"
routes:
  - route_id: zebra
    target_url: http://a
    mode: pubsub
    retry_backoff: "1000"
    parallelism: 2
  - route_id: alpha
    target_url: http://b
    mode: fifo
    retry_backoff: "1000"
    parallelism: 1
"#;
        let registry = RouteRegistry::from_yaml(yaml).unwrap();
        let ids: Vec<&str> = registry.list().iter().map(|r| r.route_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zebra"]);
        assert_eq!(registry.len(), 2);
    }
}
