use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::api::rest::{handlers, logging_middleware::request_logging_middleware};
use crate::api::ws::socket_handler;
use crate::api::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let project_routes = Router::new()
        .route(
            "/container/start",
            post(handlers::containers::start_container),
        )
        .route(
            "/container/stop",
            post(handlers::containers::stop_container),
        )
        .route(
            "/container/status",
            get(handlers::containers::container_status),
        )
        .route(
            "/container/stats",
            get(handlers::containers::container_stats),
        )
        .route("/container/ssh", get(handlers::containers::container_ssh))
        .route("/ports", get(handlers::ports::list_ports))
        .route("/ports/refresh", post(handlers::ports::refresh_ports))
        .route("/processes", get(handlers::processes::list_processes))
        .route(
            "/processes/{pid}/kill",
            post(handlers::processes::kill_process),
        );

    let api_routes = Router::new()
        .route("/version", get(version))
        .route("/containers", get(handlers::containers::list_containers))
        .nest("/projects/{projectId}", project_routes);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws", get(socket_handler))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn version() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "v1"
    }))
}
