use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::SafetyConfig;
use crate::domain::bms::{BmsAlarms, CellSample};

/// Safety alarm severity levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum SafetyLevel {
    Info,
    Warn,
    Crit,
    Emerg,
}

/// Actions to take on safety violations, ordered by severity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SafetyAction {
    None,
    Log,
    ReducePower,
    Stop,
    EmergencyShutdown,
}

/// Record of a single safety violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub timestamp: DateTime<Utc>,
    pub level: SafetyLevel,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    pub action: SafetyAction,
}

impl SafetyViolation {
    fn new(
        timestamp: DateTime<Utc>,
        level: SafetyLevel,
        category: &str,
        message: String,
        value: Option<f64>,
        limit: Option<f64>,
        action: SafetyAction,
    ) -> Self {
        Self {
            timestamp,
            level,
            category: category.to_string(),
            message,
            value,
            limit,
            action,
        }
    }
}

/// Telemetry snapshot the safety manager evaluates each tick
///
/// Fields are optional: an absent value is flagged and its dependent checks
/// are skipped rather than evaluated against a guessed zero.
#[derive(Debug, Clone, Default)]
pub struct SafetySample {
    pub soc_percent: Option<f64>,
    pub soh_percent: Option<f64>,
    pub pack_voltage_v: Option<f64>,
    /// Signed: positive = charge
    pub pack_current_a: Option<f64>,
    pub temperature_c: Option<f64>,
    pub power_kw: Option<f64>,
    pub cells: Vec<CellSample>,
    pub alarms: Option<BmsAlarms>,
}

/// Latched runtime state, the part that must survive restart
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuntimeState {
    pub emergency_stopped: bool,
    pub power_reduction_factor: f64,
}

/// Reset was refused: the triggering condition has not been quiet long enough
#[derive(Debug, Error)]
#[error("safety reset refused: {reason}")]
pub struct ResetRefused {
    pub reason: String,
}

/// Safety manager for BESS operations
///
/// Pure decision core: evaluates a telemetry snapshot against the configured
/// limits and produces a deterministic violation list plus latched state.
/// It never commands hardware and never fails.
pub struct SafetyManager {
    limits: SafetyConfig,
    history: VecDeque<SafetyViolation>,

    emergency_stopped: bool,
    power_reduction_factor: f64,

    // Rate-of-change tracking
    last_soc: Option<(DateTime<Utc>, f64)>,
    last_power: Option<(DateTime<Utc>, f64)>,

    /// Most recent violation of severity >= WARN; gates reset
    last_warn_or_above: Option<DateTime<Utc>>,
}

impl SafetyManager {
    pub fn new(limits: SafetyConfig) -> Self {
        Self {
            limits,
            history: VecDeque::new(),
            emergency_stopped: false,
            power_reduction_factor: 1.0,
            last_soc: None,
            last_power: None,
            last_warn_or_above: None,
        }
    }

    /// Restore the persisted latch at boot to prevent an unsafe cold start
    pub fn with_runtime(limits: SafetyConfig, runtime: RuntimeState) -> Self {
        let mut manager = Self::new(limits);
        manager.emergency_stopped = runtime.emergency_stopped;
        manager.power_reduction_factor = runtime.power_reduction_factor.clamp(0.0, 1.0);
        manager
    }

    pub fn runtime(&self) -> RuntimeState {
        RuntimeState {
            emergency_stopped: self.emergency_stopped,
            power_reduction_factor: self.power_reduction_factor,
        }
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stopped
    }

    pub fn power_reduction_factor(&self) -> f64 {
        self.power_reduction_factor
    }

    pub fn limits(&self) -> &SafetyConfig {
        &self.limits
    }

    /// Evaluate all safety conditions for one tick
    ///
    /// Returns the violations found, in check order. State transitions
    /// (latch, reduction factor) are applied from the aggregate action.
    pub fn check(&mut self, sample: &SafetySample, now: DateTime<Utc>) -> Vec<SafetyViolation> {
        let mut violations = Vec::new();

        self.check_completeness(sample, now, &mut violations);
        self.check_cell_voltages(sample, now, &mut violations);
        self.check_pack_voltage(sample, now, &mut violations);
        self.check_current(sample, now, &mut violations);
        self.check_temperature(sample, now, &mut violations);
        self.check_soc(sample, now, &mut violations);
        self.check_soh(sample, now, &mut violations);
        self.check_rate_limits(sample, now, &mut violations);
        self.check_bms_alarms(sample, now, &mut violations);

        self.handle_violations(&violations, now);

        for v in &violations {
            self.history.push_back(v.clone());
        }
        while self.history.len() > self.limits.violation_history {
            self.history.pop_front();
        }

        violations
    }

    /// Apply the current latch and reduction factor to a requested setpoint
    ///
    /// Returns 0 while the emergency latch is set; otherwise the magnitude is
    /// scaled by the reduction factor and clamped to the rated power.
    pub fn apply_limits(&self, requested_kw: f64, rated_kw: f64) -> f64 {
        if self.emergency_stopped {
            return 0.0;
        }
        if !requested_kw.is_finite() {
            return 0.0;
        }
        let magnitude = (requested_kw.abs() * self.power_reduction_factor).min(rated_kw.abs());
        requested_kw.signum() * magnitude
    }

    /// Operator reset. Refused until no violation of severity >= WARN has
    /// been observed for the configured cool-down window. Automatic clearing
    /// of the emergency latch is forbidden; this is the only path.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Result<(), ResetRefused> {
        let cooldown = Duration::seconds(self.limits.reset_cooldown_secs as i64);
        if let Some(last) = self.last_warn_or_above {
            let quiet_for = now - last;
            if quiet_for < cooldown {
                return Err(ResetRefused {
                    reason: format!(
                        "violations observed {}s ago, need {}s quiet",
                        quiet_for.num_seconds(),
                        cooldown.num_seconds()
                    ),
                });
            }
        }
        if self.emergency_stopped {
            info!("emergency latch cleared by operator reset");
        }
        self.emergency_stopped = false;
        self.power_reduction_factor = 1.0;
        Ok(())
    }

    /// Latch an emergency from outside the check path (operator command)
    pub fn trigger_emergency(&mut self, now: DateTime<Utc>, message: &str) {
        error!("EMERGENCY STOP: {}", message);
        let violation = SafetyViolation::new(
            now,
            SafetyLevel::Emerg,
            "operator_emergency_stop",
            message.to_string(),
            None,
            None,
            SafetyAction::EmergencyShutdown,
        );
        self.emergency_stopped = true;
        self.power_reduction_factor = 0.0;
        self.last_warn_or_above = Some(now);
        self.history.push_back(violation);
        while self.history.len() > self.limits.violation_history {
            self.history.pop_front();
        }
    }

    /// Record an externally detected stop condition (e.g. inverter fault)
    pub fn force_stop(&mut self, now: DateTime<Utc>, category: &str, message: &str) {
        error!(category, "SAFETY STOP: {}", message);
        let violation = SafetyViolation::new(
            now,
            SafetyLevel::Crit,
            category,
            message.to_string(),
            None,
            None,
            SafetyAction::Stop,
        );
        self.power_reduction_factor = 0.0;
        self.last_warn_or_above = Some(now);
        self.history.push_back(violation);
        while self.history.len() > self.limits.violation_history {
            self.history.pop_front();
        }
    }

    pub fn recent_violations(&self, count: usize) -> Vec<SafetyViolation> {
        let start = self.history.len().saturating_sub(count);
        self.history.iter().skip(start).cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn check_completeness(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        let mut missing = Vec::new();
        if sample.soc_percent.is_none() {
            missing.push("soc");
        }
        if sample.pack_voltage_v.is_none() {
            missing.push("voltage");
        }
        if sample.pack_current_a.is_none() {
            missing.push("current");
        }
        if sample.temperature_c.is_none() {
            missing.push("temperature");
        }
        if !missing.is_empty() {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Warn,
                "telemetry_incomplete",
                format!("Missing telemetry fields: {}", missing.join(", ")),
                None,
                None,
                SafetyAction::Log,
            ));
        }
    }

    fn check_cell_voltages(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        if sample.cells.is_empty() {
            return;
        }

        let voltages: Vec<f64> = sample.cells.iter().map(|c| c.voltage_v).collect();
        let min_v = voltages.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_v = voltages.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let delta = max_v - min_v;

        if min_v < self.limits.min_cell_voltage {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Crit,
                "cell_undervoltage",
                format!(
                    "Cell undervoltage: {:.3}V < {:.3}V",
                    min_v, self.limits.min_cell_voltage
                ),
                Some(min_v),
                Some(self.limits.min_cell_voltage),
                SafetyAction::Stop,
            ));
        }

        if max_v > self.limits.max_cell_voltage {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Crit,
                "cell_overvoltage",
                format!(
                    "Cell overvoltage: {:.3}V > {:.3}V",
                    max_v, self.limits.max_cell_voltage
                ),
                Some(max_v),
                Some(self.limits.max_cell_voltage),
                SafetyAction::Stop,
            ));
        }

        if delta > self.limits.max_cell_voltage_delta {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Warn,
                "cell_imbalance",
                format!(
                    "Cell voltage imbalance: {:.3}V > {:.3}V",
                    delta, self.limits.max_cell_voltage_delta
                ),
                Some(delta),
                Some(self.limits.max_cell_voltage_delta),
                SafetyAction::ReducePower,
            ));
        }
    }

    fn check_pack_voltage(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        let Some(pack_voltage) = sample.pack_voltage_v else {
            return;
        };

        if pack_voltage < self.limits.min_pack_voltage {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Crit,
                "pack_undervoltage",
                format!("Pack undervoltage: {:.1}V", pack_voltage),
                Some(pack_voltage),
                Some(self.limits.min_pack_voltage),
                SafetyAction::Stop,
            ));
        }

        if pack_voltage > self.limits.max_pack_voltage {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Crit,
                "pack_overvoltage",
                format!("Pack overvoltage: {:.1}V", pack_voltage),
                Some(pack_voltage),
                Some(self.limits.max_pack_voltage),
                SafetyAction::Stop,
            ));
        }
    }

    fn check_current(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        let Some(pack_current) = sample.pack_current_a else {
            return;
        };

        // Positive current = charging
        if pack_current > self.limits.max_charge_current_a {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Crit,
                "overcurrent_charge",
                format!("Charge overcurrent: {:.1}A", pack_current),
                Some(pack_current),
                Some(self.limits.max_charge_current_a),
                SafetyAction::ReducePower,
            ));
        }

        if pack_current < 0.0 && pack_current.abs() > self.limits.max_discharge_current_a {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Crit,
                "overcurrent_discharge",
                format!("Discharge overcurrent: {:.1}A", pack_current.abs()),
                Some(pack_current.abs()),
                Some(self.limits.max_discharge_current_a),
                SafetyAction::ReducePower,
            ));
        }
    }

    fn check_temperature(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        if let Some(temperature) = sample.temperature_c {
            if temperature > self.limits.critical_temperature_c {
                out.push(SafetyViolation::new(
                    now,
                    SafetyLevel::Emerg,
                    "critical_temperature",
                    format!("CRITICAL TEMPERATURE: {:.1}C", temperature),
                    Some(temperature),
                    Some(self.limits.critical_temperature_c),
                    SafetyAction::EmergencyShutdown,
                ));
            } else if temperature > self.limits.max_temperature_c {
                out.push(SafetyViolation::new(
                    now,
                    SafetyLevel::Crit,
                    "overtemperature",
                    format!("Overtemperature: {:.1}C", temperature),
                    Some(temperature),
                    Some(self.limits.max_temperature_c),
                    SafetyAction::ReducePower,
                ));
            } else if temperature < self.limits.min_temperature_c {
                out.push(SafetyViolation::new(
                    now,
                    SafetyLevel::Warn,
                    "undertemperature",
                    format!("Undertemperature: {:.1}C", temperature),
                    Some(temperature),
                    Some(self.limits.min_temperature_c),
                    SafetyAction::ReducePower,
                ));
            }
        }

        // Any cell above critical triggers shutdown even if the pack sensor reads lower
        let max_cell_temp = sample
            .cells
            .iter()
            .filter_map(|c| c.temperature_c)
            .fold(None::<f64>, |acc, t| {
                Some(acc.map_or(t, |a| a.max(t)))
            });
        if let Some(max_temp) = max_cell_temp {
            if max_temp > self.limits.critical_temperature_c {
                out.push(SafetyViolation::new(
                    now,
                    SafetyLevel::Emerg,
                    "cell_critical_temperature",
                    format!("CELL CRITICAL TEMPERATURE: {:.1}C", max_temp),
                    Some(max_temp),
                    Some(self.limits.critical_temperature_c),
                    SafetyAction::EmergencyShutdown,
                ));
            }
        }
    }

    fn check_soc(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        let Some(soc) = sample.soc_percent else {
            return;
        };

        if soc < self.limits.min_soc_percent {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Warn,
                "low_soc",
                format!("Low SOC: {:.1}%", soc),
                Some(soc),
                Some(self.limits.min_soc_percent),
                SafetyAction::ReducePower,
            ));
        }

        if soc > self.limits.max_soc_percent {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Warn,
                "high_soc",
                format!("High SOC: {:.1}%", soc),
                Some(soc),
                Some(self.limits.max_soc_percent),
                SafetyAction::ReducePower,
            ));
        }
    }

    fn check_soh(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        let Some(soh) = sample.soh_percent else {
            return;
        };

        if soh < self.limits.min_soh_percent {
            out.push(SafetyViolation::new(
                now,
                SafetyLevel::Warn,
                "low_soh",
                format!("Low SOH: {:.1}% - battery degraded", soh),
                Some(soh),
                Some(self.limits.min_soh_percent),
                SafetyAction::Log,
            ));
        }
    }

    fn check_rate_limits(
        &mut self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        if let Some(soc) = sample.soc_percent {
            if let Some((last_time, last_soc)) = self.last_soc {
                let minutes = (now - last_time).num_milliseconds() as f64 / 60_000.0;
                if minutes > 0.0 {
                    let soc_rate = (soc - last_soc).abs() / minutes;
                    if soc_rate > self.limits.max_soc_rate_percent_per_min {
                        out.push(SafetyViolation::new(
                            now,
                            SafetyLevel::Warn,
                            "soc_rate_limit",
                            format!("SOC changing too fast: {:.2}%/min", soc_rate),
                            Some(soc_rate),
                            Some(self.limits.max_soc_rate_percent_per_min),
                            SafetyAction::ReducePower,
                        ));
                    }
                }
            }
            self.last_soc = Some((now, soc));
        }

        if let Some(power) = sample.power_kw {
            if let Some((last_time, last_power)) = self.last_power {
                let seconds = (now - last_time).num_milliseconds() as f64 / 1000.0;
                if seconds > 0.0 {
                    let ramp = (power - last_power).abs() / seconds;
                    if ramp > self.limits.max_power_ramp_kw_per_s {
                        out.push(SafetyViolation::new(
                            now,
                            SafetyLevel::Warn,
                            "power_ramp_limit",
                            format!("Power ramping too fast: {:.2} kW/s", ramp),
                            Some(ramp),
                            Some(self.limits.max_power_ramp_kw_per_s),
                            SafetyAction::Log,
                        ));
                    }
                }
            }
            self.last_power = Some((now, power));
        }
    }

    fn check_bms_alarms(
        &self,
        sample: &SafetySample,
        now: DateTime<Utc>,
        out: &mut Vec<SafetyViolation>,
    ) {
        let Some(alarms) = sample.alarms else {
            return;
        };

        let faults = [
            (alarms.overvoltage_fault, "bms_overvoltage_fault", "BMS overvoltage fault"),
            (alarms.overcurrent_fault, "bms_overcurrent_fault", "BMS overcurrent fault"),
            (
                alarms.overtemperature_fault,
                "bms_overtemperature_fault",
                "BMS overtemperature fault",
            ),
            (
                alarms.short_circuit_fault,
                "bms_short_circuit_fault",
                "BMS short circuit fault",
            ),
        ];

        for (active, category, message) in faults {
            if active {
                out.push(SafetyViolation::new(
                    now,
                    SafetyLevel::Emerg,
                    category,
                    message.to_string(),
                    None,
                    None,
                    SafetyAction::EmergencyShutdown,
                ));
            }
        }
    }

    /// Apply the aggregate action for this tick: the maximum over violations
    /// in the order EMERGENCY_SHUTDOWN > STOP > REDUCE_POWER > LOG > NONE.
    fn handle_violations(&mut self, violations: &[SafetyViolation], now: DateTime<Utc>) {
        if violations.is_empty() {
            return;
        }

        if violations.iter().any(|v| v.level >= SafetyLevel::Warn) {
            self.last_warn_or_above = Some(now);
        }

        let max_action = violations
            .iter()
            .map(|v| v.action)
            .max()
            .unwrap_or(SafetyAction::None);

        match max_action {
            SafetyAction::EmergencyShutdown => {
                error!("EMERGENCY SHUTDOWN TRIGGERED");
                self.emergency_stopped = true;
                self.power_reduction_factor = 0.0;
            }
            SafetyAction::Stop => {
                error!("SAFETY STOP TRIGGERED");
                self.power_reduction_factor = 0.0;
            }
            SafetyAction::ReducePower => {
                warn!("reducing power due to safety violation");
                self.power_reduction_factor = self.power_reduction_factor.min(0.5);
            }
            SafetyAction::Log | SafetyAction::None => {}
        }

        for v in violations {
            match v.level {
                SafetyLevel::Emerg | SafetyLevel::Crit => {
                    error!(category = %v.category, value = ?v.value, limit = ?v.limit, "SAFETY: {}", v.message)
                }
                SafetyLevel::Warn => {
                    warn!(category = %v.category, value = ?v.value, limit = ?v.limit, "SAFETY: {}", v.message)
                }
                SafetyLevel::Info => info!(category = %v.category, "SAFETY: {}", v.message),
            }
        }
    }
}
