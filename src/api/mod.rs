pub mod campus;
pub mod error;
pub mod grid;
pub mod node;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::campus::CampusState;
use crate::config::Config;
use crate::grid::GridState;
use crate::node::NodeState;

pub fn node_router(state: NodeState, cfg: &Config) -> Router {
    let api = Router::new()
        .route("/health", get(node::health))
        .route("/telemetry", get(node::telemetry))
        .route("/power", post(node::set_power))
        .route("/control", post(node::control))
        .route("/safety/violations", get(node::safety_violations))
        .with_state(state);
    finish(Router::new().nest("/api/v1", api), cfg)
}

pub fn campus_router(state: CampusState, cfg: &Config) -> Router {
    let api = Router::new()
        .route("/health", get(campus::health))
        .route("/telemetry", get(campus::telemetry).post(campus::ingest_telemetry))
        .route("/register", post(campus::register_node))
        .route("/nodes", get(campus::nodes))
        .route("/nodes/:node_id", get(campus::node_detail))
        .route("/capacity", get(campus::capacity))
        .route("/dispatch", post(campus::dispatch))
        .with_state(state);
    finish(Router::new().nest("/api/v1", api), cfg)
}

pub fn grid_router(state: GridState, cfg: &Config) -> Router {
    let api = Router::new()
        .route("/health", get(grid::health))
        .route("/frequency/status", get(grid::frequency_status))
        .route("/droop/status", get(grid::droop_status))
        .route("/droop/settings", put(grid::update_droop_settings))
        .route("/droop/control", post(grid::droop_control))
        .with_state(state);
    finish(Router::new().nest("/api/v1", api), cfg)
}

fn finish(router: Router, cfg: &Config) -> Router {
    let mut router = router.layer(TraceLayer::new_for_http());
    if cfg.server.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}
