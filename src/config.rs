#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_app_config"))]
pub struct AppConfig {
    /// Which tier of the platform this process runs as
    #[serde(default = "default_role")]
    pub role: Role,

    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub node: NodeConfig,

    #[validate(nested)]
    #[serde(default)]
    pub safety: SafetyConfig,

    #[validate(nested)]
    #[serde(default)]
    pub campus: CampusConfig,

    #[validate(nested)]
    #[serde(default)]
    pub frequency: FrequencyConfig,

    #[validate(nested)]
    #[serde(default)]
    pub droop: DroopConfig,

    #[validate(nested)]
    #[serde(default)]
    pub pmu: PmuConfig,

    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Cross-section coherence: the droop law's nominal frequency must sit
/// inside the monitor's normal band, which itself sits inside the critical
/// thresholds. A 60 Hz region configures all of them together or the
/// process refuses to start.
fn validate_app_config(config: &AppConfig) -> Result<(), validator::ValidationError> {
    validate_nominal_in_bands(config.droop.f_nominal_hz, &config.frequency)
}

/// Enforce critical_low < normal_min <= f_nominal <= normal_max < critical_high
pub fn validate_nominal_in_bands(
    f_nominal_hz: f64,
    frequency: &FrequencyConfig,
) -> Result<(), validator::ValidationError> {
    let coherent = frequency.critical_low_hz < frequency.normal_min_hz
        && frequency.normal_min_hz <= f_nominal_hz
        && f_nominal_hz <= frequency.normal_max_hz
        && frequency.normal_max_hz < frequency.critical_high_hz;
    if !coherent {
        return Err(validator::ValidationError::new(
            "f_nominal must satisfy critical_low < normal_min <= f_nominal <= normal_max < critical_high",
        ));
    }
    Ok(())
}

/// Process role: one binary, three deployment shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Node controller: one physical BESS
    Node,
    /// Campus aggregator: a set of nodes at one site
    Campus,
    /// Grid tier: frequency monitor + droop controller
    Grid,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Node controller configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_node_config"))]
pub struct NodeConfig {
    #[validate(length(min = 1))]
    pub node_id: String,

    #[validate(length(min = 1))]
    pub campus_id: String,

    #[validate(range(min = 0.1, max = 100000.0))]
    pub rated_power_kw: f64,

    #[validate(range(min = 0.1, max = 1000000.0))]
    pub energy_capacity_kwh: f64,

    /// Control tick period (seconds)
    #[serde(default = "default_tick_seconds")]
    #[validate(range(min = 1, max = 60))]
    pub tick_seconds: u64,

    /// Telemetry publish cadence (seconds)
    #[serde(default = "default_telemetry_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub telemetry_interval_secs: u64,

    /// Campus aggregator base URL for registration and telemetry publish
    #[serde(default)]
    pub campus_url: Option<String>,

    /// Expected BMS frame period; data older than 3x this is stale
    #[serde(default = "default_bms_frame_period_ms")]
    #[validate(range(min = 10, max = 60000))]
    pub bms_frame_period_ms: u64,

    /// Inverter write deadline per attempt
    #[serde(default = "default_inverter_timeout_ms")]
    #[validate(range(min = 10, max = 30000))]
    pub inverter_timeout_ms: u64,

    /// Consecutive failed ticks before the inverter is marked FAULT
    #[serde(default = "default_inverter_fault_threshold")]
    #[validate(range(min = 1, max = 100))]
    pub inverter_fault_threshold: u32,

    /// Per-tick ramp limit applied to commanded power (kW/s)
    #[serde(default = "default_node_ramp_kw_per_s")]
    #[validate(range(min = 0.1, max = 10000.0))]
    pub ramp_kw_per_s: f64,

    /// File holding the persisted safety latch across restarts
    #[serde(default = "default_safety_state_file")]
    pub safety_state_file: PathBuf,

    #[serde(default = "default_hardware_mode")]
    pub hardware: HardwareMode,

    #[serde(default)]
    pub modbus: Option<ModbusConfig>,
}

fn validate_node_config(config: &NodeConfig) -> Result<(), validator::ValidationError> {
    if !config.rated_power_kw.is_finite() || !config.energy_capacity_kwh.is_finite() {
        return Err(validator::ValidationError::new(
            "rated_power_kw and energy_capacity_kwh must be finite",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    Simulated,
    Modbus,
}

/// Modbus endpoint configuration (hardware mode)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ModbusConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[validate(range(min = 1, max = 247))]
    pub unit_id: u8,

    #[validate(range(min = 100, max = 30000))]
    pub timeout_ms: u64,
}

/// Safety manager limits and policy
///
/// Each bound pair is a closed interval with low <= high, enforced at load.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_safety_config"))]
pub struct SafetyConfig {
    #[serde(default = "default_min_cell_voltage")]
    pub min_cell_voltage: f64,
    #[serde(default = "default_max_cell_voltage")]
    pub max_cell_voltage: f64,

    #[serde(default = "default_min_pack_voltage")]
    pub min_pack_voltage: f64,
    #[serde(default = "default_max_pack_voltage")]
    pub max_pack_voltage: f64,

    #[serde(default = "default_max_charge_current")]
    pub max_charge_current_a: f64,
    #[serde(default = "default_max_discharge_current")]
    pub max_discharge_current_a: f64,

    #[serde(default = "default_min_temperature")]
    pub min_temperature_c: f64,
    #[serde(default = "default_max_temperature")]
    pub max_temperature_c: f64,
    #[serde(default = "default_critical_temperature")]
    pub critical_temperature_c: f64,

    #[serde(default = "default_min_soc")]
    pub min_soc_percent: f64,
    #[serde(default = "default_max_soc")]
    pub max_soc_percent: f64,

    /// Maximum SOC rate of change (% per minute)
    #[serde(default = "default_max_soc_rate")]
    pub max_soc_rate_percent_per_min: f64,

    /// Maximum power ramp observed in telemetry (kW per second)
    #[serde(default = "default_max_power_ramp")]
    pub max_power_ramp_kw_per_s: f64,

    /// Maximum cell voltage spread before imbalance is flagged (V)
    #[serde(default = "default_max_cell_delta")]
    pub max_cell_voltage_delta: f64,

    #[serde(default = "default_min_soh")]
    pub min_soh_percent: f64,

    /// Quiet window with no >= WARN violations required before reset (s)
    #[serde(default = "default_reset_cooldown_secs")]
    #[validate(range(min = 0, max = 86400))]
    pub reset_cooldown_secs: u64,

    /// Bounded violation history length
    #[serde(default = "default_violation_history")]
    #[validate(range(min = 1, max = 100000))]
    pub violation_history: usize,
}

fn validate_safety_config(config: &SafetyConfig) -> Result<(), validator::ValidationError> {
    let intervals = [
        (config.min_cell_voltage, config.max_cell_voltage),
        (config.min_pack_voltage, config.max_pack_voltage),
        (config.min_temperature_c, config.max_temperature_c),
        (config.min_soc_percent, config.max_soc_percent),
    ];
    for (lo, hi) in intervals {
        if !(lo.is_finite() && hi.is_finite()) || lo > hi {
            return Err(validator::ValidationError::new(
                "safety bound intervals must be finite with low <= high",
            ));
        }
    }
    if config.critical_temperature_c < config.max_temperature_c {
        return Err(validator::ValidationError::new(
            "critical_temperature_c must be >= max_temperature_c",
        ));
    }
    if config.max_charge_current_a <= 0.0 || config.max_discharge_current_a <= 0.0 {
        return Err(validator::ValidationError::new(
            "current limits must be positive",
        ));
    }
    Ok(())
}

/// Campus aggregator configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CampusConfig {
    #[validate(length(min = 1))]
    pub campus_id: String,

    /// Telemetry poll period; nodes unseen for 2x this are marked offline
    #[serde(default = "default_poll_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub poll_interval_secs: u64,

    /// Bounded concurrency for per-node polls
    #[serde(default = "default_poll_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub poll_concurrency: usize,

    /// Per-node poll deadline (seconds)
    #[serde(default = "default_node_poll_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub node_poll_timeout_secs: u64,

    /// Per-node dispatch deadline (seconds)
    #[serde(default = "default_dispatch_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub dispatch_timeout_secs: u64,

    /// Regional aggregator to register with at startup (optional)
    #[serde(default)]
    pub region_url: Option<String>,
}

/// Frequency monitor band thresholds (IEGC defaults; configurable per region)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_frequency_config"))]
pub struct FrequencyConfig {
    #[serde(default = "default_freq_critical_low")]
    pub critical_low_hz: f64,

    #[serde(default = "default_freq_normal_min")]
    pub normal_min_hz: f64,

    #[serde(default = "default_freq_normal_max")]
    pub normal_max_hz: f64,

    #[serde(default = "default_freq_critical_high")]
    pub critical_high_hz: f64,

    /// Rolling statistics window (seconds)
    #[serde(default = "default_stats_window_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub stats_window_secs: u64,

    /// Expected PMU sample rate, sizes the ring buffer
    #[serde(default = "default_sample_rate_hz")]
    #[validate(range(min = 1.0, max = 100.0))]
    pub sample_rate_hz: f64,
}

fn validate_frequency_config(config: &FrequencyConfig) -> Result<(), validator::ValidationError> {
    let ordered = config.critical_low_hz < config.normal_min_hz
        && config.normal_min_hz < config.normal_max_hz
        && config.normal_max_hz < config.critical_high_hz;
    if !ordered {
        return Err(validator::ValidationError::new(
            "frequency thresholds must satisfy critical_low < normal_min < normal_max < critical_high",
        ));
    }
    Ok(())
}

/// Droop controller configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_droop_config"))]
pub struct DroopConfig {
    /// Droop percentage (IEGC standard: 5%)
    #[serde(default = "default_droop_percent")]
    #[validate(range(min = 0.1, max = 100.0))]
    pub droop_percent: f64,

    #[serde(default = "default_deadband_low")]
    pub deadband_low_hz: f64,

    #[serde(default = "default_deadband_high")]
    pub deadband_high_hz: f64,

    #[serde(default = "default_f_nominal")]
    pub f_nominal_hz: f64,

    /// Power available for frequency response (kW)
    #[serde(default = "default_droop_max_power")]
    #[validate(range(min = 0.1, max = 10000000.0))]
    pub max_power_kw: f64,

    #[serde(default = "default_droop_ramp")]
    #[validate(range(min = 0.1, max = 100000.0))]
    pub ramp_rate_kw_per_s: f64,

    #[serde(default = "default_true")]
    pub enable_damping: bool,

    #[serde(default = "default_damping_gain")]
    pub damping_gain: f64,

    #[serde(default = "default_response_mode")]
    pub mode: String,

    /// Minimum hold on the emergency fan-out path (seconds)
    #[serde(default = "default_emergency_hold_secs")]
    #[validate(range(min = 1, max = 600))]
    pub emergency_hold_secs: u64,

    /// Campus aggregator that receives droop setpoints
    #[serde(default)]
    pub campus_url: Option<String>,
}

fn validate_droop_config(config: &DroopConfig) -> Result<(), validator::ValidationError> {
    if !(config.deadband_low_hz <= config.f_nominal_hz
        && config.f_nominal_hz <= config.deadband_high_hz)
    {
        return Err(validator::ValidationError::new(
            "deadband must bracket f_nominal (deadband_low <= f_nominal <= deadband_high)",
        ));
    }
    Ok(())
}

/// PMU stream configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PmuConfig {
    #[serde(default = "default_pmu_mode")]
    pub mode: PmuMode,

    #[serde(default = "default_pmu_host")]
    pub host: String,

    #[serde(default = "default_pmu_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Sample interval in milliseconds (100ms = 10 Hz)
    #[serde(default = "default_pmu_interval_ms")]
    #[validate(range(min = 10, max = 1000))]
    pub sample_interval_ms: u64,

    /// Hold a stale sample for at most this long before the stream is invalid
    #[serde(default = "default_pmu_hold_ms")]
    #[validate(range(min = 10, max = 10000))]
    pub hold_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PmuMode {
    Simulated,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

// Default value functions
fn default_role() -> Role { Role::Node }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_tick_seconds() -> u64 { 1 }
fn default_telemetry_interval_secs() -> u64 { 5 }
fn default_bms_frame_period_ms() -> u64 { 1000 }
fn default_inverter_timeout_ms() -> u64 { 200 }
fn default_inverter_fault_threshold() -> u32 { 5 }
fn default_node_ramp_kw_per_s() -> f64 { 10.0 }
fn default_safety_state_file() -> PathBuf { PathBuf::from("data/safety_state.json") }
fn default_hardware_mode() -> HardwareMode { HardwareMode::Simulated }
fn default_min_cell_voltage() -> f64 { 2.8 }
fn default_max_cell_voltage() -> f64 { 4.2 }
fn default_min_pack_voltage() -> f64 { 44.8 }
fn default_max_pack_voltage() -> f64 { 67.2 }
fn default_max_charge_current() -> f64 { 100.0 }
fn default_max_discharge_current() -> f64 { 100.0 }
fn default_min_temperature() -> f64 { -10.0 }
fn default_max_temperature() -> f64 { 55.0 }
fn default_critical_temperature() -> f64 { 60.0 }
fn default_min_soc() -> f64 { 10.0 }
fn default_max_soc() -> f64 { 95.0 }
fn default_max_soc_rate() -> f64 { 1.0 }
fn default_max_power_ramp() -> f64 { 10.0 }
fn default_max_cell_delta() -> f64 { 0.1 }
fn default_min_soh() -> f64 { 70.0 }
fn default_reset_cooldown_secs() -> u64 { 60 }
fn default_violation_history() -> usize { 100 }
fn default_poll_interval_secs() -> u64 { 10 }
fn default_poll_concurrency() -> usize { 16 }
fn default_node_poll_timeout_secs() -> u64 { 5 }
fn default_dispatch_timeout_secs() -> u64 { 5 }
fn default_freq_critical_low() -> f64 { 49.50 }
fn default_freq_normal_min() -> f64 { 49.90 }
fn default_freq_normal_max() -> f64 { 50.05 }
fn default_freq_critical_high() -> f64 { 50.50 }
fn default_stats_window_secs() -> u64 { 60 }
fn default_sample_rate_hz() -> f64 { 10.0 }
fn default_droop_percent() -> f64 { 5.0 }
fn default_deadband_low() -> f64 { 49.90 }
fn default_deadband_high() -> f64 { 50.05 }
fn default_f_nominal() -> f64 { 50.0 }
fn default_droop_max_power() -> f64 { 1000.0 }
fn default_droop_ramp() -> f64 { 50.0 }
fn default_true() -> bool { true }
fn default_damping_gain() -> f64 { 0.1 }
fn default_response_mode() -> String { "primary".to_string() }
fn default_emergency_hold_secs() -> u64 { 5 }
fn default_pmu_mode() -> PmuMode { PmuMode::Simulated }
fn default_pmu_host() -> String { "localhost".to_string() }
fn default_pmu_port() -> u16 { 4712 }
fn default_pmu_interval_ms() -> u64 { 100 }
fn default_pmu_hold_ms() -> u64 { 200 }
fn default_log_level() -> String { "info".to_string() }

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "BESS_01".to_string(),
            campus_id: "CAMPUS_01".to_string(),
            rated_power_kw: 100.0,
            energy_capacity_kwh: 200.0,
            tick_seconds: default_tick_seconds(),
            telemetry_interval_secs: default_telemetry_interval_secs(),
            campus_url: None,
            bms_frame_period_ms: default_bms_frame_period_ms(),
            inverter_timeout_ms: default_inverter_timeout_ms(),
            inverter_fault_threshold: default_inverter_fault_threshold(),
            ramp_kw_per_s: default_node_ramp_kw_per_s(),
            safety_state_file: default_safety_state_file(),
            hardware: default_hardware_mode(),
            modbus: None,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_cell_voltage: default_min_cell_voltage(),
            max_cell_voltage: default_max_cell_voltage(),
            min_pack_voltage: default_min_pack_voltage(),
            max_pack_voltage: default_max_pack_voltage(),
            max_charge_current_a: default_max_charge_current(),
            max_discharge_current_a: default_max_discharge_current(),
            min_temperature_c: default_min_temperature(),
            max_temperature_c: default_max_temperature(),
            critical_temperature_c: default_critical_temperature(),
            min_soc_percent: default_min_soc(),
            max_soc_percent: default_max_soc(),
            max_soc_rate_percent_per_min: default_max_soc_rate(),
            max_power_ramp_kw_per_s: default_max_power_ramp(),
            max_cell_voltage_delta: default_max_cell_delta(),
            min_soh_percent: default_min_soh(),
            reset_cooldown_secs: default_reset_cooldown_secs(),
            violation_history: default_violation_history(),
        }
    }
}

impl Default for CampusConfig {
    fn default() -> Self {
        Self {
            campus_id: "CAMPUS_01".to_string(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_concurrency: default_poll_concurrency(),
            node_poll_timeout_secs: default_node_poll_timeout_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            region_url: None,
        }
    }
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            critical_low_hz: default_freq_critical_low(),
            normal_min_hz: default_freq_normal_min(),
            normal_max_hz: default_freq_normal_max(),
            critical_high_hz: default_freq_critical_high(),
            stats_window_secs: default_stats_window_secs(),
            sample_rate_hz: default_sample_rate_hz(),
        }
    }
}

impl Default for DroopConfig {
    fn default() -> Self {
        Self {
            droop_percent: default_droop_percent(),
            deadband_low_hz: default_deadband_low(),
            deadband_high_hz: default_deadband_high(),
            f_nominal_hz: default_f_nominal(),
            max_power_kw: default_droop_max_power(),
            ramp_rate_kw_per_s: default_droop_ramp(),
            enable_damping: default_true(),
            damping_gain: default_damping_gain(),
            mode: default_response_mode(),
            emergency_hold_secs: default_emergency_hold_secs(),
            campus_url: None,
        }
    }
}

impl Default for PmuConfig {
    fn default() -> Self {
        Self {
            mode: default_pmu_mode(),
            host: default_pmu_host(),
            port: default_pmu_port(),
            sample_interval_ms: default_pmu_interval_ms(),
            hold_ms: default_pmu_hold_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml (base configuration)
    /// 2. config/<environment>.toml (environment-specific)
    /// 3. Environment variables with VPP__ prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    /// Load configuration with a specific environment override
    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            let env_file = format!("config/{}.toml", env);
            figment = figment.merge(Toml::file(env_file));
        } else {
            figment = figment.merge(Toml::file("config/development.toml").nested());
        }

        // VPP__SERVER__PORT -> server.port
        figment = figment.merge(Env::prefixed("VPP__").split("__"));

        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;

        // Operating with unsafe limits is worse than not starting at all
        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }
}

pub type Config = AppConfig;
