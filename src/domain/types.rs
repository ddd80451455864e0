#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::safety::SafetyViolation;

/// Stable identity of a BESS node, fixed at registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub campus_id: String,
    pub rated_power_kw: f64,
    pub energy_capacity_kwh: f64,
}

impl NodeIdentity {
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.is_empty() {
            return Err("node_id must not be empty".to_string());
        }
        if !self.rated_power_kw.is_finite() || self.rated_power_kw <= 0.0 {
            return Err(format!(
                "rated_power_kw must be positive, got {}",
                self.rated_power_kw
            ));
        }
        if !self.energy_capacity_kwh.is_finite() || self.energy_capacity_kwh <= 0.0 {
            return Err(format!(
                "energy_capacity_kwh must be positive, got {}",
                self.energy_capacity_kwh
            ));
        }
        Ok(())
    }
}

/// Node status as seen by the campus aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Fault,
}

/// Aggregate power/energy capacity, summed over online nodes only
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub rated_power_kw: f64,
    pub energy_capacity_kwh: f64,
    pub available_power_kw: f64,
    pub available_energy_kwh: f64,
}

/// A signed real-power target, valid for a finite window
///
/// Sign convention: positive = charge, negative = discharge, matching the
/// telemetry `power_kw` field. Newer setpoints supersede older ones by
/// (source_id, seq); out-of-order arrivals are dropped by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    pub target_kw: f64,
    #[serde(default)]
    pub target_kvar: f64,
    pub valid_until: DateTime<Utc>,
    pub reason: String,
    pub source_id: String,
    pub seq: u64,
}

impl Setpoint {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.valid_until >= now
    }
}

/// Control verbs carried by a `control` message; all idempotent except
/// `emergency_stop`, which sets the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ControlAction {
    Enable,
    Disable,
    ResetAlarms,
    EmergencyStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub action: ControlAction,
}

/// Node status flags in the upward telemetry schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub enabled: bool,
    pub online: bool,
    pub alarms_bitmask: u16,
    pub faults_bitmask: u16,
}

/// BMS detail block of the telemetry schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmsTelemetry {
    pub pack_voltage: f64,
    pub pack_current: f64,
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub voltage_delta: f64,
    pub max_cell_temperature: Option<f64>,
    pub is_balanced: bool,
    pub num_cells: usize,
    pub critical_fault: bool,
    pub warnings: bool,
}

/// Inverter detail block of the telemetry schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterTelemetry {
    pub ac_power_kw: f64,
    pub ac_voltage: f64,
    pub ac_current: f64,
    pub ac_frequency: f64,
    pub dc_voltage: f64,
    pub dc_current: f64,
    pub efficiency: f64,
    pub temperature: f64,
    pub status: String,
}

/// Safety block of the telemetry schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyTelemetry {
    pub emergency_stopped: bool,
    pub power_reduction_factor: f64,
    #[serde(default)]
    pub violations: Vec<SafetyViolation>,
}

/// Upward telemetry schema (NC -> CA, CA -> regional)
///
/// Keys are stable; measured values are optional so that absence is
/// distinguished from zero. `power_kw` sign: positive = charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub node_id: String,
    pub campus_id: String,
    /// ISO-8601 UTC with trailing Z (chrono's default serde format)
    pub ts: DateTime<Utc>,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature: Option<f64>,
    pub power_kw: Option<f64>,
    pub reactive_power_kvar: Option<f64>,
    pub frequency: Option<f64>,
    pub capacity_kwh: f64,
    pub max_power_kw: f64,
    pub cycle_count: Option<u32>,
    pub status: StatusFlags,
    pub bms: Option<BmsTelemetry>,
    pub inverter: Option<InverterTelemetry>,
    pub safety: SafetyTelemetry,
}

/// Aggregated campus rollup published upward by the campus tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampusTelemetry {
    pub campus_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_power_kw: f64,
    pub total_capacity_kwh: f64,
    pub average_soc: f64,
    pub average_soh: f64,
    pub average_temperature: Option<f64>,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub fault_nodes: usize,
    pub min_soc: f64,
    pub max_soc: f64,
    pub total_energy_available_kwh: f64,
}

/// Per-node result of a campus dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub commanded_kw: f64,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Delivery vector for one dispatch call; the aggregator does not wait for
/// per-node acks before returning it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub total_kw: f64,
    pub strategy: String,
    pub outcomes: std::collections::BTreeMap<String, DeliveryOutcome>,
    /// Residual power that could not be allocated due to clamp saturation
    pub residual_kw: f64,
    pub saturated: bool,
}

impl DeliveryReport {
    pub fn all_delivered(&self) -> bool {
        self.outcomes.values().all(|o| o.delivered)
    }
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ok = self.outcomes.values().filter(|o| o.delivered).count();
        write!(
            f,
            "dispatch {:.1} kW via {}: {}/{} delivered",
            self.total_kw,
            self.strategy,
            ok,
            self.outcomes.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_identity_rejects_nonpositive_rating() {
        let identity = NodeIdentity {
            node_id: "BESS_01".to_string(),
            campus_id: "CAMPUS_01".to_string(),
            rated_power_kw: 0.0,
            energy_capacity_kwh: 200.0,
        };
        assert!(identity.validate().is_err());
    }

    #[test]
    fn setpoint_freshness() {
        let now = Utc::now();
        let sp = Setpoint {
            target_kw: 10.0,
            target_kvar: 0.0,
            valid_until: now + chrono::Duration::seconds(5),
            reason: "test".to_string(),
            source_id: "campus".to_string(),
            seq: 1,
        };
        assert!(sp.is_fresh(now));
        assert!(!sp.is_fresh(now + chrono::Duration::seconds(6)));
    }

    #[test]
    fn telemetry_ts_serializes_with_trailing_z() {
        let ts: DateTime<Utc> = "2025-06-01T12:00:00Z".parse().unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert!(json.ends_with("Z\""), "expected trailing Z, got {}", json);
    }

    #[test]
    fn control_action_wire_names() {
        let json = serde_json::to_string(&ControlAction::ResetAlarms).unwrap();
        assert_eq!(json, "\"reset_alarms\"");
        let parsed: ControlAction = serde_json::from_str("\"emergency_stop\"").unwrap();
        assert_eq!(parsed, ControlAction::EmergencyStop);
    }

    #[test]
    fn absent_measurement_is_distinguished_from_zero() {
        #[derive(Serialize)]
        struct Probe {
            soc: Option<f64>,
        }
        let absent = serde_json::to_string(&Probe { soc: None }).unwrap();
        let zero = serde_json::to_string(&Probe { soc: Some(0.0) }).unwrap();
        assert_eq!(absent, r#"{"soc":null}"#);
        assert_eq!(zero, r#"{"soc":0.0}"#);
    }
}
