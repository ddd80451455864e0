#![allow(dead_code)]
//! Grid tier API endpoints

use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::api::error::ApiError;
use crate::config::validate_nominal_in_bands;
use crate::grid::droop::DroopSettings;
use crate::grid::GridState;

/// Health check
pub async fn health(State(st): State<GridState>) -> impl IntoResponse {
    let monitor = st.monitor.lock().await;
    let droop = st.droop.lock().await;
    Json(json!({
        "status": "healthy",
        "band": monitor.band(),
        "current_hz": monitor.current_hz(),
        "droop_enabled": droop.is_enabled(),
    }))
}

/// Frequency monitor statistics
pub async fn frequency_status(State(st): State<GridState>) -> impl IntoResponse {
    Json(st.monitor.lock().await.stats())
}

/// Droop controller status
pub async fn droop_status(State(st): State<GridState>) -> impl IntoResponse {
    Json(st.droop.lock().await.status())
}

/// Replace the droop settings
pub async fn update_droop_settings(
    State(st): State<GridState>,
    Json(settings): Json<DroopSettings>,
) -> Result<impl IntoResponse, ApiError> {
    if settings.droop_percent <= 0.0 || !settings.droop_percent.is_finite() {
        return Err(ApiError::BadRequest("droop_percent must be positive".to_string()));
    }
    if !(settings.deadband_low_hz <= settings.f_nominal_hz
        && settings.f_nominal_hz <= settings.deadband_high_hz)
    {
        return Err(ApiError::BadRequest(
            "deadband must bracket f_nominal".to_string(),
        ));
    }
    // The droop nominal must stay coherent with the monitor's bands, or the
    // droop law and the band classification would disagree about the grid
    validate_nominal_in_bands(settings.f_nominal_hz, &st.frequency)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    st.droop.lock().await.update_settings(settings);
    Ok(Json(json!({"outcome": "accepted"})))
}

#[derive(Debug, Deserialize)]
pub struct DroopControlRequest {
    pub action: DroopControlAction,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DroopControlAction {
    Enable,
    Disable,
}

/// Enable or disable the droop controller
pub async fn droop_control(
    State(st): State<GridState>,
    Json(request): Json<DroopControlRequest>,
) -> impl IntoResponse {
    let mut droop = st.droop.lock().await;
    match request.action {
        DroopControlAction::Enable => droop.enable(),
        DroopControlAction::Disable => droop.disable(),
    }
    Json(json!({"outcome": "accepted"}))
}
