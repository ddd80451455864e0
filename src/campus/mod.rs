#![allow(dead_code)]
//! Campus aggregator: one site, many nodes
//!
//! Presents aggregate capacity and telemetry for a set of registered node
//! controllers and translates a campus-level power target into per-node
//! setpoints. The node map is written only by the registration and poll
//! paths; dispatch works from a snapshot.

pub mod client;
pub mod dispatch;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{CampusConfig, Config};
use crate::domain::{
    CampusTelemetry, DeliveryOutcome, DeliveryReport, NodeCapacity, NodeIdentity, NodeStatus,
    Setpoint, TelemetryReport,
};
use client::{NodeClient, NodeListing, RegisterCampusRequest, UpstreamClient};
use dispatch::{DispatchNode, DispatchStrategy};

/// Axum state for the campus role
#[derive(Clone)]
pub struct CampusState {
    pub aggregator: Arc<CampusAggregator>,
}

impl CampusState {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            aggregator: Arc::new(CampusAggregator::new(cfg.campus.clone())?),
        })
    }
}

/// Everything the aggregator holds about one node; reference snapshots only,
/// node-owned state is never mutated here.
#[derive(Clone)]
pub struct NodeEntry {
    pub identity: NodeIdentity,
    pub endpoint: String,
    pub status: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_report: Option<TelemetryReport>,
    client: NodeClient,
}

impl NodeEntry {
    fn soc(&self) -> Option<f64> {
        self.last_report.as_ref().and_then(|r| r.soc)
    }
}

pub struct CampusAggregator {
    cfg: CampusConfig,
    nodes: RwLock<HashMap<String, NodeEntry>>,
    /// Monotonic sequence for setpoints issued by this aggregator
    seq: AtomicU64,
    source_id: String,
}

impl CampusAggregator {
    pub fn new(cfg: CampusConfig) -> Result<Self> {
        let source_id = format!("campus:{}", cfg.campus_id);
        Ok(Self {
            cfg,
            nodes: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(1),
            source_id,
        })
    }

    pub fn campus_id(&self) -> &str {
        &self.cfg.campus_id
    }

    /// Idempotent node registration
    pub async fn register(&self, identity: NodeIdentity, endpoint: String) -> Result<()> {
        identity
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid node identity: {e}"))?;

        let client = NodeClient::new(
            &endpoint,
            Duration::from_secs(self.cfg.node_poll_timeout_secs),
        )?;

        let mut nodes = self.nodes.write().await;
        let node_id = identity.node_id.clone();
        match nodes.get_mut(&node_id) {
            Some(entry) => {
                // Re-registration refreshes identity and endpoint, keeps history
                entry.identity = identity;
                entry.endpoint = endpoint;
                entry.client = client;
            }
            None => {
                info!(node_id = %node_id, endpoint = %endpoint, "node registered");
                nodes.insert(
                    node_id.clone(),
                    NodeEntry {
                        identity,
                        endpoint,
                        status: NodeStatus::Offline,
                        last_seen: None,
                        last_report: None,
                        client,
                    },
                );
            }
        }
        Ok(())
    }

    /// Accept a pushed telemetry report (nodes publish on their own cadence
    /// between polls)
    pub async fn ingest_telemetry(&self, report: TelemetryReport) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let Some(entry) = nodes.get_mut(&report.node_id) else {
            anyhow::bail!("unknown node: {}", report.node_id);
        };
        entry.last_seen = Some(Utc::now());
        entry.status = status_from_report(&report);
        entry.last_report = Some(report);
        Ok(())
    }

    /// Poll every registered node with bounded concurrency and refresh the
    /// snapshot map. Nodes unseen for 2x the poll interval go offline.
    pub async fn poll_all(&self) {
        let targets: Vec<(String, NodeClient)> = {
            let nodes = self.nodes.read().await;
            nodes
                .iter()
                .map(|(id, e)| (id.clone(), e.client.clone()))
                .collect()
        };

        let results: Vec<(String, Result<TelemetryReport>)> = stream::iter(targets)
            .map(|(id, client)| async move {
                let result = client.fetch_telemetry().await;
                (id, result)
            })
            .buffer_unordered(self.cfg.poll_concurrency)
            .collect()
            .await;

        let now = Utc::now();
        let offline_after = ChronoDuration::seconds(2 * self.cfg.poll_interval_secs as i64);
        let mut nodes = self.nodes.write().await;
        for (node_id, result) in results {
            let Some(entry) = nodes.get_mut(&node_id) else {
                continue;
            };
            match result {
                Ok(report) => {
                    entry.last_seen = Some(now);
                    entry.status = status_from_report(&report);
                    entry.last_report = Some(report);
                }
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "node poll failed");
                    let stale = entry
                        .last_seen
                        .map(|seen| now - seen > offline_after)
                        .unwrap_or(true);
                    if stale && entry.status != NodeStatus::Fault {
                        if entry.status == NodeStatus::Online {
                            warn!(node_id = %node_id, "node marked offline");
                        }
                        entry.status = NodeStatus::Offline;
                    }
                }
            }
        }
    }

    /// Aggregate capacity; OFFLINE/FAULT nodes are excluded from available_*
    pub async fn aggregate_capacity(&self) -> NodeCapacity {
        let nodes = self.nodes.read().await;
        let mut capacity = NodeCapacity::default();

        for entry in nodes.values() {
            capacity.rated_power_kw += entry.identity.rated_power_kw;
            capacity.energy_capacity_kwh += entry.identity.energy_capacity_kwh;

            if entry.status == NodeStatus::Online {
                capacity.available_power_kw += entry.identity.rated_power_kw;
                let usable = entry
                    .soc()
                    .map(|soc| entry.identity.energy_capacity_kwh * soc / 100.0)
                    .unwrap_or(0.0);
                capacity.available_energy_kwh += usable;
            }
        }
        capacity
    }

    pub async fn campus_telemetry(&self) -> CampusTelemetry {
        let capacity = self.aggregate_capacity().await;
        let nodes = self.nodes.read().await;

        let online: Vec<&NodeEntry> = nodes
            .values()
            .filter(|e| e.status == NodeStatus::Online)
            .collect();
        let fault_count = nodes
            .values()
            .filter(|e| e.status == NodeStatus::Fault)
            .count();

        let socs: Vec<f64> = online.iter().filter_map(|e| e.soc()).collect();
        let sohs: Vec<f64> = online
            .iter()
            .filter_map(|e| e.last_report.as_ref().and_then(|r| r.soh))
            .collect();
        let total_power: f64 = online
            .iter()
            .filter_map(|e| e.last_report.as_ref().and_then(|r| r.power_kw))
            .sum();
        let temperatures: Vec<f64> = online
            .iter()
            .filter_map(|e| e.last_report.as_ref().and_then(|r| r.temperature))
            .collect();

        CampusTelemetry {
            campus_id: self.cfg.campus_id.clone(),
            timestamp: Utc::now(),
            total_power_kw: total_power,
            total_capacity_kwh: capacity.energy_capacity_kwh,
            average_soc: mean(&socs).unwrap_or(0.0),
            average_soh: mean(&sohs).unwrap_or(100.0),
            average_temperature: mean(&temperatures),
            total_nodes: nodes.len(),
            online_nodes: online.len(),
            fault_nodes: fault_count,
            min_soc: socs.iter().cloned().reduce(f64::min).unwrap_or(0.0),
            max_soc: socs.iter().cloned().reduce(f64::max).unwrap_or(0.0),
            total_energy_available_kwh: capacity.available_energy_kwh,
        }
    }

    pub async fn node_listing(&self) -> Vec<NodeListing> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .map(|e| NodeListing {
                identity: e.identity.clone(),
                endpoint: e.endpoint.clone(),
                status: e.status,
                soc: e.soc(),
            })
            .collect()
    }

    pub async fn node_report(&self, node_id: &str) -> Option<(NodeListing, Option<TelemetryReport>)> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).map(|e| {
            (
                NodeListing {
                    identity: e.identity.clone(),
                    endpoint: e.endpoint.clone(),
                    status: e.status,
                    soc: e.soc(),
                },
                e.last_report.clone(),
            )
        })
    }

    /// Split and deliver a campus power target
    ///
    /// Failed deliveries are recorded and the node is excluded from
    /// available capacity on the next cycle; the shortfall is not re-split
    /// here to avoid oscillation.
    pub async fn dispatch(
        &self,
        total_kw: f64,
        strategy: &str,
        manual: Option<HashMap<String, f64>>,
    ) -> Result<DeliveryReport, dispatch::DispatchError> {
        let strategy = DispatchStrategy::from_str(strategy)
            .map_err(|_| dispatch::DispatchError::UnknownStrategy(strategy.to_string()))?;

        // Snapshot of online nodes; the map is not held across deliveries
        let online: Vec<(DispatchNode, NodeClient)> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|e| e.status == NodeStatus::Online)
                .map(|e| {
                    (
                        DispatchNode {
                            node_id: e.identity.node_id.clone(),
                            rated_kw: e.identity.rated_power_kw,
                            soc_percent: e.soc().unwrap_or(50.0),
                        },
                        e.client.clone(),
                    )
                })
                .collect()
        };

        let inputs: Vec<DispatchNode> = online.iter().map(|(n, _)| n.clone()).collect();
        let plan = dispatch::plan(total_kw, strategy, &inputs, manual.as_ref())?;

        let now = Utc::now();
        let valid_until = now + ChronoDuration::seconds(2 * self.cfg.poll_interval_secs as i64);
        let clients: HashMap<String, NodeClient> = online
            .into_iter()
            .map(|(n, c)| (n.node_id, c))
            .collect();

        let deliveries = stream::iter(plan.allocations.clone())
            .map(|(node_id, commanded_kw)| {
                let client = clients.get(&node_id).cloned();
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                let setpoint = Setpoint {
                    target_kw: commanded_kw,
                    target_kvar: 0.0,
                    valid_until,
                    reason: format!("campus dispatch ({strategy})"),
                    source_id: self.source_id.clone(),
                    seq,
                };
                async move {
                    let result = match client {
                        Some(client) => client.send_setpoint(&setpoint).await,
                        None => Err(anyhow::anyhow!("node disappeared from registry")),
                    };
                    (node_id, commanded_kw, result)
                }
            })
            .buffer_unordered(self.cfg.poll_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut outcomes = BTreeMap::new();
        let mut failed_nodes = Vec::new();
        for (node_id, commanded_kw, result) in deliveries {
            let outcome = match result {
                Ok(()) => DeliveryOutcome {
                    commanded_kw,
                    delivered: true,
                    error: None,
                },
                Err(e) => {
                    failed_nodes.push(node_id.clone());
                    DeliveryOutcome {
                        commanded_kw,
                        delivered: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.insert(node_id, outcome);
        }

        if !failed_nodes.is_empty() {
            let mut nodes = self.nodes.write().await;
            for node_id in &failed_nodes {
                if let Some(entry) = nodes.get_mut(node_id) {
                    warn!(node_id = %node_id, "dispatch delivery failed, excluding from available capacity");
                    entry.status = NodeStatus::Offline;
                }
            }
        }

        Ok(DeliveryReport {
            total_kw,
            strategy: strategy.to_string(),
            outcomes,
            residual_kw: plan.residual_kw,
            saturated: plan.saturated,
        })
    }

    async fn register_with_region(&self) {
        let Some(region_url) = &self.cfg.region_url else {
            return;
        };
        let capacity = self.aggregate_capacity().await;
        let num_nodes = self.nodes.read().await.len();
        let request = RegisterCampusRequest {
            campus_id: self.cfg.campus_id.clone(),
            rated_power_kw: capacity.rated_power_kw,
            energy_capacity_kwh: capacity.energy_capacity_kwh,
            num_nodes,
        };
        match UpstreamClient::new(region_url, Duration::from_secs(10)) {
            Ok(client) => {
                if let Err(e) = client.register_campus(&request).await {
                    warn!(error = %e, "regional registration failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to build regional client"),
        }
    }
}

fn status_from_report(report: &TelemetryReport) -> NodeStatus {
    if report.status.faults_bitmask != 0 || report.safety.emergency_stopped {
        NodeStatus::Fault
    } else {
        NodeStatus::Online
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn spawn_campus_tasks(state: CampusState, cfg: &Config) {
    let aggregator = Arc::clone(&state.aggregator);
    let poll_secs = cfg.campus.poll_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(poll_secs));
        loop {
            interval.tick().await;
            aggregator.poll_all().await;
        }
    });

    let aggregator = Arc::clone(&state.aggregator);
    tokio::spawn(async move {
        aggregator.register_with_region().await;
    });
}
