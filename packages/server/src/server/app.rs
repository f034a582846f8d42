//! Application setup and router wiring.

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;
use crate::kernel::ServerKernel;
use crate::render::RenderService;
use crate::server::routes;

/// Shared state for every route handler.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<ServerKernel>,
    pub broker: Arc<Broker>,
    pub render: Arc<RenderService>,
}

pub fn build_app(kernel: Arc<ServerKernel>) -> Router {
    let broker = Broker::new(Arc::clone(&kernel));
    let render = Arc::new(RenderService::new(Arc::clone(&kernel)));
    let state = AppState {
        kernel,
        broker,
        render,
    };
    build_app_with_state(state)
}

pub fn build_app_with_state(state: AppState) -> Router {
    Router::new()
        // Queue
        .route("/queue/enqueue", post(routes::queue::enqueue_handler))
        .route("/queue/lease", post(routes::queue::lease_handler))
        .route("/queue/:job_id/complete", post(routes::queue::complete_handler))
        .route("/queue/:job_id/fail", post(routes::queue::fail_handler))
        .route("/queue/:job_id/extend", post(routes::queue::extend_handler))
        // Rendering and events
        .route("/context/render", post(routes::render::render_handler))
        .route("/events", post(routes::events::append_handler))
        // Executions
        .route("/executions", post(routes::executions::start_handler))
        .route("/executions/:execution_id", get(routes::executions::status_handler))
        .route(
            "/executions/:execution_id/cancel",
            post(routes::executions::cancel_handler),
        )
        // Transient variables
        .route("/vars/:execution_id/:name", get(routes::vars::get_handler))
        .route("/vars/:execution_id", post(routes::vars::set_handler))
        // Catalog
        .route(
            "/catalog/playbooks",
            post(routes::catalog::register_handler).get(routes::catalog::list_handler),
        )
        .route("/catalog/playbooks/:catalog_id", get(routes::catalog::fetch_handler))
        // Health
        .route("/health", get(routes::health::health_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
