#![allow(dead_code)]
//! Campus aggregator API endpoints

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::api::error::ApiError;
use crate::campus::client::{CampusDispatchRequest, NodesResponse, RegisterNodeRequest};
use crate::campus::dispatch::DispatchError;
use crate::campus::CampusState;
use crate::domain::TelemetryReport;

/// Health check
pub async fn health(State(st): State<CampusState>) -> impl IntoResponse {
    let listing = st.aggregator.node_listing().await;
    let online = listing
        .iter()
        .filter(|n| n.status == crate::domain::NodeStatus::Online)
        .count();
    Json(json!({
        "status": "healthy",
        "campus_id": st.aggregator.campus_id(),
        "num_nodes": listing.len(),
        "online_nodes": online,
    }))
}

/// Aggregated campus telemetry rollup
pub async fn telemetry(State(st): State<CampusState>) -> impl IntoResponse {
    Json(st.aggregator.campus_telemetry().await)
}

/// Ingest a pushed node telemetry report
pub async fn ingest_telemetry(
    State(st): State<CampusState>,
    Json(report): Json<TelemetryReport>,
) -> Result<impl IntoResponse, ApiError> {
    st.aggregator
        .ingest_telemetry(report)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(json!({"outcome": "accepted"})))
}

/// Register a node (idempotent)
pub async fn register_node(
    State(st): State<CampusState>,
    Json(request): Json<RegisterNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    st.aggregator
        .register(request.identity, request.endpoint)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(json!({"outcome": "accepted"})))
}

/// All campus nodes
pub async fn nodes(State(st): State<CampusState>) -> impl IntoResponse {
    Json(NodesResponse {
        campus_id: st.aggregator.campus_id().to_string(),
        nodes: st.aggregator.node_listing().await,
    })
}

/// One node with its latest telemetry
pub async fn node_detail(
    State(st): State<CampusState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match st.aggregator.node_report(&node_id).await {
        Some((node, telemetry)) => Ok(Json(json!({
            "node": node,
            "telemetry": telemetry,
        }))),
        None => Err(ApiError::NotFound(format!("node {node_id}"))),
    }
}

/// Aggregate campus capacity
pub async fn capacity(State(st): State<CampusState>) -> impl IntoResponse {
    Json(st.aggregator.aggregate_capacity().await)
}

/// Split and deliver a campus power target
pub async fn dispatch(
    State(st): State<CampusState>,
    Json(request): Json<CampusDispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !request.total_kw.is_finite() {
        return Err(ApiError::BadRequest("total_kw must be finite".to_string()));
    }

    let report = st
        .aggregator
        .dispatch(request.total_kw, &request.strategy, request.node_setpoints)
        .await
        .map_err(|e| match e {
            DispatchError::NoOnlineNodes => ApiError::NoOnlineNodes(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        })?;

    let outcome = if report.all_delivered() {
        "accepted".to_string()
    } else {
        format!(
            "partial:{}",
            serde_json::to_string(
                &report
                    .outcomes
                    .iter()
                    .map(|(id, o)| (id.clone(), o.delivered))
                    .collect::<std::collections::BTreeMap<_, _>>()
            )
            .unwrap_or_default()
        )
    };

    Ok(Json(json!({
        "outcome": outcome,
        "report": report,
    })))
}
