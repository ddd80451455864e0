#![allow(dead_code)]
//! Node controller API endpoints

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::error::ApiError;
use crate::domain::{ControlCommand, Setpoint};
use crate::node::NodeState;

/// Health check
pub async fn health(State(st): State<NodeState>) -> impl IntoResponse {
    let controller = &st.controller;
    let identity = controller.identity().clone();
    Json(json!({
        "status": "healthy",
        "node_id": identity.node_id,
        "campus_id": identity.campus_id,
        "enabled": controller.is_enabled(),
        "emergency_stopped": controller.is_emergency_stopped().await,
    }))
}

/// Latest telemetry report
pub async fn telemetry(State(st): State<NodeState>) -> Result<impl IntoResponse, ApiError> {
    match st.controller.last_report().await {
        Some(report) => Ok(Json(report)),
        None => Err(ApiError::ServiceUnavailable(
            "telemetry not available yet".to_string(),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub outcome: String,
}

/// Queue a power setpoint
///
/// The setpoint is always accepted into the channel; the safety manager's
/// envelope is applied when it is executed, so a latched node will apply 0.
pub async fn set_power(
    State(st): State<NodeState>,
    Json(setpoint): Json<Setpoint>,
) -> Result<impl IntoResponse, ApiError> {
    if !setpoint.target_kw.is_finite() || !setpoint.target_kvar.is_finite() {
        return Err(ApiError::BadRequest("setpoint must be finite".to_string()));
    }

    st.controller
        .submit_setpoint(setpoint)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    Ok((
        StatusCode::OK,
        Json(CommandResponse {
            outcome: "accepted".to_string(),
        }),
    ))
}

/// Execute a control verb
pub async fn control(
    State(st): State<NodeState>,
    Json(command): Json<ControlCommand>,
) -> Result<impl IntoResponse, ApiError> {
    match st.controller.control(command.action).await {
        Ok(()) => Ok(Json(CommandResponse {
            outcome: "accepted".to_string(),
        })),
        Err(e) => Err(ApiError::SafetyRejected(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct ViolationsQuery {
    #[serde(default = "default_violation_limit")]
    pub limit: usize,
}

fn default_violation_limit() -> usize {
    50
}

/// Recent safety violations
pub async fn safety_violations(
    State(st): State<NodeState>,
    axum::extract::Query(q): axum::extract::Query<ViolationsQuery>,
) -> impl IntoResponse {
    let violations = st.controller.recent_violations(q.limit).await;
    Json(json!({
        "count": violations.len(),
        "violations": violations,
    }))
}
