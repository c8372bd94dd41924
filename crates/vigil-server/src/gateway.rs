//! Ingestion gateway
//!
//! Admission contract: parse the body into an event (or 400), overwrite
//! the caller's `event_id`/`timestamp`, publish to the durable log under a
//! bounded timeout, and answer 202 before any storage write happens. A
//! failed or timed-out publish is a 500 and the event is dropped here —
//! there is no gateway-side retry or buffering.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use vigil_core::AuditEvent;
use vigil_log::EventPublisher;
use vigil_store::EventStore;

use crate::ratelimit::{rate_limit, RateLimiter};

/// How long a readiness probe waits on each dependency
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Long-lived resources the handlers share
#[derive(Clone)]
pub struct AppState {
    /// Publish side of the durable log
    pub publisher: Arc<dyn EventPublisher>,
    /// Partitioned event store (readiness probe and read path)
    pub store: EventStore,
    /// Bounded wait for a publish acknowledgment
    pub publish_timeout: Duration,
}

/// Build the gateway router
pub fn router(state: AppState, limiter: Arc<RateLimiter>) -> Router {
    let limited = Router::new()
        .route("/events", post(submit_event))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit));

    Router::new()
        .merge(limited)
        .route("/", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/events/search", get(search_events))
        .with_state(state)
}

/// POST /events — admit one audit event
async fn submit_event(
    State(state): State<AppState>,
    payload: Result<Json<AuditEvent>, JsonRejection>,
) -> Response {
    let Json(mut event) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "message": rejection.body_text(),
                })),
            )
                .into_response();
        }
    };

    // Identity and admission time are ours, whatever the caller sent
    event.stamp();

    match tokio::time::timeout(state.publish_timeout, state.publisher.publish(&event)).await {
        Ok(Ok(())) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "queued",
                "event_id": event.event_id,
            })),
        )
            .into_response(),
        Ok(Err(err)) => {
            error!(event_id = %event.event_id, error = %err, "Failed to publish event");
            publish_failure()
        }
        Err(_) => {
            error!(event_id = %event.event_id, "Publish timed out");
            publish_failure()
        }
    }
}

fn publish_failure() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status": "error",
            "message": "Failed to queue event",
        })),
    )
        .into_response()
}

/// GET / — process liveness
async fn liveness() -> Json<serde_json::Value> {
    Json(json!({
        "status": "UP",
        "service": "vigil",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health/ready — storage and log reachability
async fn readiness(State(state): State<AppState>) -> Response {
    let store_up = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, state.store.ping()).await,
        Ok(Ok(()))
    );
    let log_up = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, state.publisher.ping()).await,
        Ok(Ok(()))
    );

    let healthy = store_up && log_up;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "UP" } else { "DOWN" },
            "checks": {
                "store": if store_up { "UP" } else { "DOWN" },
                "log": if log_up { "UP" } else { "DOWN" },
            },
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    key: String,
    value: String,
}

/// GET /events/search — containment lookup over the `changes` blob
async fn search_events(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Response {
    match state.store.find_by_change(params.key, params.value).await {
        Ok(events) => {
            info!(matches = events.len(), "Containment query served");
            Json(events).into_response()
        }
        Err(err) => {
            error!(error = %err, "Containment query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "message": "Search failed",
                })),
            )
                .into_response()
        }
    }
}
