#![allow(dead_code)]
//! HTTP clients for inter-tier calls
//!
//! Every call carries a deadline; transient failures are retried with
//! exponential backoff by the middleware before surfacing as errors.

use anyhow::{bail, Context, Result};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{ControlAction, ControlCommand, NodeIdentity, Setpoint, TelemetryReport};

fn retrying_client(timeout: Duration) -> Result<ClientWithMiddleware> {
    let inner = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
    Ok(ClientBuilder::new(inner)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// Node registration payload (NC -> CA)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    #[serde(flatten)]
    pub identity: NodeIdentity,
    /// Base URL the aggregator polls for telemetry and sends setpoints to
    pub endpoint: String,
}

/// Campus registration payload (CA -> regional tier)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterCampusRequest {
    pub campus_id: String,
    pub rated_power_kw: f64,
    pub energy_capacity_kwh: f64,
    pub num_nodes: usize,
}

/// Client for calls up the hierarchy (node -> campus, campus -> regional)
pub struct UpstreamClient {
    base: String,
    http: ClientWithMiddleware,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http: retrying_client(timeout)?,
        })
    }

    pub async fn register_node(&self, identity: &NodeIdentity, endpoint: &str) -> Result<()> {
        let body = RegisterNodeRequest {
            identity: identity.clone(),
            endpoint: endpoint.to_string(),
        };
        let resp = self
            .http
            .post(format!("{}/api/v1/register", self.base))
            .json(&body)
            .send()
            .await
            .context("node registration request failed")?;
        if !resp.status().is_success() {
            bail!("node registration rejected: {}", resp.status());
        }
        Ok(())
    }

    pub async fn register_campus(&self, req: &RegisterCampusRequest) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/api/v1/campus/register", self.base))
            .json(req)
            .send()
            .await
            .context("campus registration request failed")?;
        if !resp.status().is_success() {
            bail!("campus registration rejected: {}", resp.status());
        }
        Ok(())
    }

    pub async fn publish_telemetry(&self, report: &TelemetryReport) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/api/v1/telemetry", self.base))
            .json(report)
            .send()
            .await
            .context("telemetry publish failed")?;
        if !resp.status().is_success() {
            bail!("telemetry publish rejected: {}", resp.status());
        }
        Ok(())
    }

    /// Submit a campus-level dispatch (FDC -> CA)
    pub async fn dispatch(&self, req: &CampusDispatchRequest) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/api/v1/dispatch", self.base))
            .json(req)
            .send()
            .await
            .context("campus dispatch request failed")?;
        if !resp.status().is_success() {
            bail!("campus dispatch rejected: {}", resp.status());
        }
        Ok(())
    }

    /// Fetch the aggregated campus rollup (used by the grid tier for
    /// SOC/temperature-aware derating)
    pub async fn campus_telemetry(&self) -> Result<crate::domain::CampusTelemetry> {
        let resp = self
            .http
            .get(format!("{}/api/v1/telemetry", self.base))
            .send()
            .await
            .context("campus telemetry request failed")?;
        if !resp.status().is_success() {
            bail!("campus telemetry rejected: {}", resp.status());
        }
        resp.json().await.context("invalid campus telemetry body")
    }

    /// List registered nodes (used by the grid tier for emergency fan-out)
    pub async fn list_nodes(&self) -> Result<Vec<NodeListing>> {
        let resp = self
            .http
            .get(format!("{}/api/v1/nodes", self.base))
            .send()
            .await
            .context("node listing request failed")?;
        if !resp.status().is_success() {
            bail!("node listing rejected: {}", resp.status());
        }
        let listing: NodesResponse = resp.json().await.context("invalid node listing body")?;
        Ok(listing.nodes)
    }
}

/// Campus dispatch request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampusDispatchRequest {
    /// Signed total, positive = charge
    pub total_kw: f64,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Manual per-node setpoints; used with strategy "manual"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_setpoints: Option<std::collections::HashMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_strategy() -> String {
    "proportional".to_string()
}

/// One row of the campus node listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListing {
    #[serde(flatten)]
    pub identity: NodeIdentity,
    pub endpoint: String,
    pub status: crate::domain::NodeStatus,
    pub soc: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesResponse {
    pub campus_id: String,
    pub nodes: Vec<NodeListing>,
}

/// Client for calls down the hierarchy (CA or FDC -> one NC)
#[derive(Clone)]
pub struct NodeClient {
    base: String,
    http: ClientWithMiddleware,
}

impl NodeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http: retrying_client(timeout)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn fetch_telemetry(&self) -> Result<TelemetryReport> {
        let resp = self
            .http
            .get(format!("{}/api/v1/telemetry", self.base))
            .send()
            .await
            .context("telemetry poll failed")?;
        if !resp.status().is_success() {
            bail!("telemetry poll rejected: {}", resp.status());
        }
        resp.json().await.context("invalid telemetry body")
    }

    pub async fn send_setpoint(&self, setpoint: &Setpoint) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/api/v1/power", self.base))
            .json(setpoint)
            .send()
            .await
            .context("setpoint delivery failed")?;
        if !resp.status().is_success() {
            bail!("setpoint rejected: {}", resp.status());
        }
        Ok(())
    }

    pub async fn send_control(&self, action: ControlAction) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/api/v1/control", self.base))
            .json(&ControlCommand { action })
            .send()
            .await
            .context("control delivery failed")?;
        if !resp.status().is_success() {
            bail!("control rejected: {}", resp.status());
        }
        Ok(())
    }
}
