//! HTTP front door for the order saga orchestrator.
//!
//! Accepts orders, exposes saga status, and serves Prometheus metrics.
//! [`create_default_state`] boots the saga host on an in-memory bus with
//! simulated capabilities attached.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::capabilities::{
    SimulatedCreditCheck, SimulatedInventory, SimulatedPayment, SimulatedShipping, serve_all,
};
use orchestrator::{InMemoryBus, Notifier, OrchestratorConfig, SagaHost, TracingNotifier};
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::orders::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::submit::<S>))
        .route("/orders/{key}", get(routes::orders::status::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Starts the saga host with simulated capabilities on a fresh bus.
///
/// The returned host must be shut down by the caller once the server stops.
pub async fn create_default_state<S: SagaStore + Clone + 'static>(
    store: S,
    config: OrchestratorConfig,
) -> orchestrator::Result<(Arc<AppState<S>>, SagaHost<S>)> {
    // Long-running process: keep no handoff history
    let bus = InMemoryBus::with_history_limit(0);
    serve_all(
        SimulatedCreditCheck::new(),
        SimulatedPayment::new(),
        SimulatedInventory::new(),
        SimulatedShipping::new(),
        &bus,
    );

    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let host = SagaHost::start(store, bus.clone(), config, notifier).await?;

    let state = Arc::new(AppState {
        engine: host.engine().clone(),
        bus,
    });
    Ok((state, host))
}
