//! Webhook Relay HTTP API
//!
//! Endpoints:
//! - `POST /v1/routes/{route_id}/events` — accept an event for delivery
//! - `GET /v1/routes` — list configured routes
//! - `GET /health` — liveness
//! - `GET /metrics` — Prometheus exposition (only with telemetry enabled)
//! - `GET /api-docs/openapi.json` — OpenAPI document

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, error};
use utoipa::{OpenApi, ToSchema};

use wr_common::{Event, Repository};
use wr_metrics::{render_prometheus, Collector};
use wr_payload::Envelope;
use wr_routes::{Route, RouteRegistry};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub registry: Arc<RouteRegistry>,
    /// Present only when telemetry is enabled.
    pub collector: Option<Arc<dyn Collector>>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Webhook Relay API",
        version = "0.1.0",
        description = "Durable webhook intake and delivery relay",
        license(name = "MIT"),
    ),
    paths(submit_event, list_routes, health),
    components(schemas(EventAccepted, RouteInfo, HealthResponse, ErrorResponse)),
    tags(
        (name = "events", description = "Event intake"),
        (name = "routes", description = "Route listing"),
        (name = "health", description = "Health checks"),
    )
)]
pub struct ApiDoc;

/// Response for an accepted event.
#[derive(Serialize, ToSchema)]
pub struct EventAccepted {
    pub event_id: String,
    pub route_id: String,
}

/// Public view of a configured route.
#[derive(Serialize, ToSchema)]
pub struct RouteInfo {
    pub route_id: String,
    pub target_url: String,
    pub mode: String,
    pub max_retries: u32,
    pub retry_backoff: String,
    pub parallelism: u32,
    pub expected_status: u16,
}

impl From<&Route> for RouteInfo {
    fn from(route: &Route) -> Self {
        Self {
            route_id: route.route_id.clone(),
            target_url: route.target_url.clone(),
            mode: route.mode.to_string(),
            max_retries: route.max_retries,
            retry_backoff: route.retry_backoff.source().to_string(),
            parallelism: route.parallelism,
            expected_status: route.listed_expected_status(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Build the full router.
pub fn create_router(
    repo: Arc<dyn Repository>,
    registry: Arc<RouteRegistry>,
    collector: Option<Arc<dyn Collector>>,
) -> Router {
    let telemetry_enabled = collector.is_some();
    let state = AppState {
        repo,
        registry,
        collector,
    };

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/v1/routes", get(list_routes))
        .route("/v1/routes/:route_id/events", post(submit_event))
        .route("/api-docs/openapi.json", get(openapi_doc));

    if telemetry_enabled {
        router = router.route("/metrics", get(metrics));
    }

    router.with_state(state)
}

#[utoipa::path(
    post,
    path = "/v1/routes/{route_id}/events",
    tag = "events",
    params(
        ("route_id" = String, Path, description = "Route to deliver through")
    ),
    responses(
        (status = 202, description = "Event accepted for delivery", body = EventAccepted),
        (status = 400, description = "Invalid payload", body = ErrorResponse),
        (status = 404, description = "Unknown route", body = ErrorResponse),
        (status = 500, description = "Store failure", body = ErrorResponse)
    )
)]
async fn submit_event(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<EventAccepted>), ApiError> {
    let route = state.registry.get(&route_id).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("route not found: {route_id}"),
        )
    })?;

    if body.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "request body is empty"));
    }

    if let Err(e) = Envelope::parse(&body) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "invalid payload format: {e} (expected Standard Webhooks format with type, timestamp, and data)"
            ),
        ));
    }

    // First value per header name.
    let mut captured: HashMap<String, String> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            captured
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let event = Event::new(
        route_id.clone(),
        route.mode,
        body.to_vec(),
        captured,
        route.max_retries,
    );

    let event_id = state.repo.store(event).await.map_err(|e| {
        error!(route_id = %route_id, error = %e, "Failed to store event");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    debug!(event_id = %event_id, route_id = %route_id, "Event accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted { event_id, route_id }),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/routes",
    tag = "routes",
    responses(
        (status = 200, description = "Configured routes", body = Vec<RouteInfo>)
    )
)]
async fn list_routes(State(state): State<AppState>) -> Json<Vec<RouteInfo>> {
    Json(state.registry.list().into_iter().map(RouteInfo::from).collect())
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let Some(collector) = &state.collector else {
        return (StatusCode::NOT_FOUND, String::new()).into_response();
    };

    match collector.collect().await {
        Ok(snapshot) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            render_prometheus(&snapshot),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Metrics collection failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn openapi_doc() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
