use anyhow::Result;
use axum::Router;
use tracing::{info, warn};

use vpp_controller::config::{Config, Role};
use vpp_controller::{api, campus, grid, node, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    telemetry::init_tracing(&cfg.telemetry);

    let app: Router = match cfg.role {
        Role::Node => {
            let state = node::NodeState::new(&cfg).await?;
            node::spawn_node_tasks(state.clone(), &cfg);
            api::node_router(state, &cfg)
        }
        Role::Campus => {
            let state = campus::CampusState::new(&cfg)?;
            campus::spawn_campus_tasks(state.clone(), &cfg);
            api::campus_router(state, &cfg)
        }
        Role::Grid => {
            let state = grid::GridState::new(&cfg)?;
            grid::spawn_grid_tasks(state.clone(), &cfg);
            api::grid_router(state, &cfg)
        }
    };

    let addr = cfg.server.socket_addr()?;
    info!(%addr, role = ?cfg.role, "starting VPP controller");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
