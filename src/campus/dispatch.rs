//! Campus dispatch planning
//!
//! Pure functions that split a campus-level power target into per-node
//! setpoints. Sign convention: positive = charge, negative = discharge.
//! All strategies operate only on online nodes; the rounding tolerance for
//! conservation is 0.1 kW. Residual power that cannot be allocated because
//! of clamp saturation is reported, never silently dropped.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Allocation rounding tolerance (kW)
pub const DISPATCH_TOLERANCE_KW: f64 = 0.1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DispatchStrategy {
    /// Split proportionally to rated power
    Proportional,
    /// Greedy by SOC order until the target is covered
    Priority,
    /// SOC-equalizing weights with proportional fallback
    Balanced,
    /// Operator-provided map, clamped per node
    Manual,
}

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("no online nodes available")]
    NoOnlineNodes,
    #[error("unknown dispatch strategy: {0}")]
    UnknownStrategy(String),
    #[error("manual dispatch requires node_setpoints")]
    ManualWithoutSetpoints,
    #[error("manual setpoint references unknown or offline node: {0}")]
    UnknownNode(String),
    #[error("manual setpoints total {total_kw:.1} kW exceeds online capacity {capacity_kw:.1} kW")]
    ExceedsCapacity { total_kw: f64, capacity_kw: f64 },
}

/// Per-node inputs the planner needs; a reference snapshot of online nodes
#[derive(Debug, Clone)]
pub struct DispatchNode {
    pub node_id: String,
    pub rated_kw: f64,
    pub soc_percent: f64,
}

/// Result of planning one dispatch
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub allocations: BTreeMap<String, f64>,
    /// Power that could not be placed due to clamp saturation
    pub residual_kw: f64,
    pub saturated: bool,
}

impl DispatchPlan {
    fn from_allocations(total_kw: f64, allocations: BTreeMap<String, f64>) -> Self {
        let allocated: f64 = allocations.values().sum();
        let residual = total_kw - allocated;
        Self {
            allocations,
            residual_kw: residual,
            saturated: residual.abs() > DISPATCH_TOLERANCE_KW,
        }
    }

    pub fn allocated_kw(&self) -> f64 {
        self.allocations.values().sum()
    }
}

/// Split `total_kw` across `nodes` using the named strategy
pub fn plan(
    total_kw: f64,
    strategy: DispatchStrategy,
    nodes: &[DispatchNode],
    manual: Option<&HashMap<String, f64>>,
) -> Result<DispatchPlan, DispatchError> {
    if nodes.is_empty() {
        return Err(DispatchError::NoOnlineNodes);
    }

    match strategy {
        DispatchStrategy::Proportional => Ok(proportional(total_kw, nodes)),
        DispatchStrategy::Priority => Ok(priority(total_kw, nodes)),
        DispatchStrategy::Balanced => Ok(balanced(total_kw, nodes)),
        DispatchStrategy::Manual => {
            let map = manual.ok_or(DispatchError::ManualWithoutSetpoints)?;
            manual_plan(map, nodes)
        }
    }
}

fn proportional(total_kw: f64, nodes: &[DispatchNode]) -> DispatchPlan {
    let total_rated: f64 = nodes.iter().map(|n| n.rated_kw).sum();

    let allocations = nodes
        .iter()
        .map(|n| {
            let share = total_kw * n.rated_kw / total_rated;
            (n.node_id.clone(), clamp_to_rated(share, n.rated_kw))
        })
        .collect();

    DispatchPlan::from_allocations(total_kw, allocations)
}

fn priority(total_kw: f64, nodes: &[DispatchNode]) -> DispatchPlan {
    // Discharge drains the fullest nodes first; charge fills the emptiest.
    // Stable tie-break by node id ascending.
    let discharge = total_kw < 0.0;
    let sorted: Vec<&DispatchNode> = nodes
        .iter()
        .sorted_by(|a, b| {
            let ord = a.soc_percent.total_cmp(&b.soc_percent);
            let ord = if discharge { ord.reverse() } else { ord };
            ord.then_with(|| a.node_id.cmp(&b.node_id))
        })
        .collect();

    let sign = total_kw.signum();
    let mut remaining = total_kw.abs();
    let mut allocations = BTreeMap::new();

    for node in sorted {
        if remaining < DISPATCH_TOLERANCE_KW {
            allocations.insert(node.node_id.clone(), 0.0);
            continue;
        }
        let allocated = remaining.min(node.rated_kw);
        allocations.insert(node.node_id.clone(), sign * allocated);
        remaining -= allocated;
    }

    DispatchPlan::from_allocations(total_kw, allocations)
}

fn balanced(total_kw: f64, nodes: &[DispatchNode]) -> DispatchPlan {
    let mean_soc: f64 = nodes.iter().map(|n| n.soc_percent).sum::<f64>() / nodes.len() as f64;
    let discharge = total_kw < 0.0;

    // Discharge weight favors nodes above the mean; charge favors below
    let weights: Vec<f64> = nodes
        .iter()
        .map(|n| {
            let deviation = n.soc_percent - mean_soc;
            if discharge {
                deviation.max(0.0)
            } else {
                (-deviation).max(0.0)
            }
        })
        .collect();

    let weight_sum: f64 = weights.iter().sum();
    if weight_sum <= 0.0 {
        // All SOCs equal: nothing to equalize
        return proportional(total_kw, nodes);
    }

    let mut allocations: BTreeMap<String, f64> = BTreeMap::new();
    let mut clamped = Vec::new();
    for (node, weight) in nodes.iter().zip(&weights) {
        let share = total_kw * weight / weight_sum;
        let applied = clamp_to_rated(share, node.rated_kw);
        if (share - applied).abs() > 0.0 {
            clamped.push(node.node_id.clone());
        }
        allocations.insert(node.node_id.clone(), applied);
    }

    // One redistribution pass of the clamp remainder over unsaturated nodes
    let allocated: f64 = allocations.values().sum();
    let mut remainder = total_kw - allocated;
    if remainder.abs() > DISPATCH_TOLERANCE_KW {
        let unsaturated: Vec<&DispatchNode> = nodes
            .iter()
            .zip(&weights)
            .filter(|(n, w)| **w > 0.0 && !clamped.contains(&n.node_id))
            .map(|(n, _)| n)
            .collect();
        let headroom_sum: f64 = unsaturated
            .iter()
            .map(|n| n.rated_kw - allocations[&n.node_id].abs())
            .sum();
        if headroom_sum > 0.0 {
            for node in unsaturated {
                let current = allocations[&node.node_id];
                let headroom = node.rated_kw - current.abs();
                let extra = remainder * headroom / headroom_sum;
                let updated = clamp_to_rated(current + extra, node.rated_kw);
                remainder -= updated - current;
                allocations.insert(node.node_id.clone(), updated);
            }
        }
    }

    DispatchPlan::from_allocations(total_kw, allocations)
}

fn manual_plan(
    map: &HashMap<String, f64>,
    nodes: &[DispatchNode],
) -> Result<DispatchPlan, DispatchError> {
    let by_id: HashMap<&str, &DispatchNode> =
        nodes.iter().map(|n| (n.node_id.as_str(), n)).collect();

    for node_id in map.keys() {
        if !by_id.contains_key(node_id.as_str()) {
            return Err(DispatchError::UnknownNode(node_id.clone()));
        }
    }

    let requested: f64 = map.values().map(|kw| kw.abs()).sum();
    let capacity: f64 = nodes.iter().map(|n| n.rated_kw).sum();
    if requested > capacity {
        return Err(DispatchError::ExceedsCapacity {
            total_kw: requested,
            capacity_kw: capacity,
        });
    }

    let total_kw: f64 = map.values().sum();
    let allocations = nodes
        .iter()
        .map(|n| {
            let entry = map.get(&n.node_id).copied().unwrap_or(0.0);
            (n.node_id.clone(), clamp_to_rated(entry, n.rated_kw))
        })
        .collect();

    Ok(DispatchPlan::from_allocations(total_kw, allocations))
}

fn clamp_to_rated(kw: f64, rated_kw: f64) -> f64 {
    kw.clamp(-rated_kw, rated_kw)
}
