//! Shared request-handling pipeline.
//!
//! # Responsibilities
//! - Build the one Axum router every listener serves
//! - Liveness and readiness endpoints backed by the connection pools
//! - Wire up middleware (request ID, tracing, timeout, metrics)
//! - Turn handler panics into 500 responses and escalate them
//!
//! # Design Decisions
//! - The router is built once and cloned per listener; it holds no
//!   per-listener state
//! - Readiness leases a real connection from each pool, so a pool that is
//!   exhausted or closed reports not ready

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::build_info::BuildInfo;
use crate::lifecycle::trigger::{panic_message, Escalations, Trigger};
use crate::observability::metrics;
use crate::pool::TcpPool;

/// Application state injected into handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Service name reported by the health endpoint.
    pub service: &'static str,
    pub build: BuildInfo,
    pub database: Option<Arc<TcpPool>>,
    pub cache: Option<Arc<TcpPool>>,
}

impl AppState {
    pub fn new(service: &'static str, build: BuildInfo) -> Self {
        Self {
            service,
            build,
            database: None,
            cache: None,
        }
    }

    fn pools(&self) -> impl Iterator<Item = &Arc<TcpPool>> {
        self.database.iter().chain(self.cache.iter())
    }
}

/// Build the router with all middleware layers.
#[allow(deprecated)]
pub fn build_handler(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn(track_requests))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Catch handler panics: answer 500 and escalate to the lifecycle.
pub fn escalate_panics(router: Router, escalations: Escalations) -> Router {
    router.layer(CatchPanicLayer::custom(
        move |payload: Box<dyn Any + Send + 'static>| {
            let message = panic_message(&*payload);
            tracing::error!(panic = %message, "Request handler panicked");
            escalations.report(Trigger::Panic(message));

            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal server error" })),
            )
                .into_response()
        },
    ))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let pools: Vec<_> = state.pools().map(|pool| pool.status()).collect();
    Json(json!({
        "status": "ok",
        "service": state.service,
        "build": state.build,
        "pools": pools,
    }))
}

async fn ready(State(state): State<AppState>) -> Response {
    let mut failures = Vec::new();
    for pool in state.pools() {
        if let Err(e) = pool.acquire().await {
            tracing::warn!(pool = pool.name(), error = %e, "Readiness check failed");
            failures.push(json!({ "pool": pool.name(), "error": e.to_string() }));
        }
    }

    if failures.is_empty() {
        (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "failures": failures })),
        )
            .into_response()
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let response = next.run(request).await;
    metrics::record_request(&method, response.status().as_u16(), started);
    response
}
