#![allow(dead_code)]
//! Node controller: local authority over one BESS
//!
//! Runs the 1 Hz control tick, executes inbound setpoints under the safety
//! manager's envelope, and publishes normalized telemetry upward. The tick
//! task is the single writer to the inverter; setpoints arrive on a channel
//! and are merged at the start of each tick.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::campus::client::UpstreamClient;
use crate::config::{Config, HardwareMode, NodeConfig, SafetyConfig};
use crate::domain::{
    BmsReading, BmsSource, ControlAction, Inverter, InverterState, NodeIdentity, Setpoint,
    SimulatedBms, SimulatedInverter, StatusFlags, TelemetryReport,
};
use crate::domain::types::{BmsTelemetry, InverterTelemetry, SafetyTelemetry};
use crate::safety::{persist, RampLimiter, SafetyManager, SafetySample, SafetyViolation};

const SETPOINT_CHANNEL_CAPACITY: usize = 64;

/// Axum state for the node role
#[derive(Clone)]
pub struct NodeState {
    pub controller: Arc<NodeController>,
}

impl NodeState {
    pub async fn new(cfg: &Config) -> Result<Self> {
        let controller = Arc::new(NodeController::new(cfg).await?);
        Ok(Self { controller })
    }
}

struct TickState {
    /// Setpoint currently being executed
    active_setpoint: Option<Setpoint>,
    /// Highest sequence applied per source; lower arrivals are dropped
    applied_seqs: HashMap<String, u64>,
    last_commanded_kw: f64,
    last_commanded_kvar: f64,
    consecutive_write_failures: u32,
    inverter_fault: bool,
    last_inverter: Option<InverterState>,
    last_bms: Option<BmsReading>,
    last_tick: Option<DateTime<Utc>>,
}

pub struct NodeController {
    identity: NodeIdentity,
    cfg: NodeConfig,
    inverter: Arc<dyn Inverter>,
    bms: Arc<dyn BmsSource>,
    /// Concrete handles kept so the tick (and tests) can drive the simulation
    sim_bms: Option<Arc<SimulatedBms>>,
    sim_inverter: Option<Arc<SimulatedInverter>>,
    safety: Mutex<SafetyManager>,
    ramp: Mutex<RampLimiter>,
    tick: RwLock<TickState>,
    enabled: AtomicBool,
    setpoint_tx: mpsc::Sender<Setpoint>,
    setpoint_rx: Mutex<mpsc::Receiver<Setpoint>>,
    last_report: RwLock<Option<TelemetryReport>>,
    upstream: Option<UpstreamClient>,
    advertised_endpoint: String,
}

impl NodeController {
    pub async fn new(cfg: &Config) -> Result<Self> {
        let node_cfg = cfg.node.clone();
        let identity = NodeIdentity {
            node_id: node_cfg.node_id.clone(),
            campus_id: node_cfg.campus_id.clone(),
            rated_power_kw: node_cfg.rated_power_kw,
            energy_capacity_kwh: node_cfg.energy_capacity_kwh,
        };
        identity
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid node identity: {e}"))?;

        let (inverter, bms, sim_bms, sim_inverter) = build_hardware(&node_cfg).await?;

        // Restore the latch before the first tick; a cold start must not
        // forget an emergency stop.
        let safety = match persist::load(&node_cfg.safety_state_file).await {
            Some(runtime) => {
                if runtime.emergency_stopped {
                    warn!("restored persisted emergency latch; operator reset required");
                }
                SafetyManager::with_runtime(cfg.safety.clone(), runtime)
            }
            None => SafetyManager::new(cfg.safety.clone()),
        };

        let (setpoint_tx, setpoint_rx) = mpsc::channel(SETPOINT_CHANNEL_CAPACITY);

        let upstream = node_cfg
            .campus_url
            .as_ref()
            .map(|url| UpstreamClient::new(url, Duration::from_secs(5)))
            .transpose()?;

        Ok(Self {
            identity,
            ramp: Mutex::new(RampLimiter::new(node_cfg.ramp_kw_per_s)),
            cfg: node_cfg,
            inverter,
            bms,
            sim_bms,
            sim_inverter,
            safety: Mutex::new(safety),
            tick: RwLock::new(TickState {
                active_setpoint: None,
                applied_seqs: HashMap::new(),
                last_commanded_kw: 0.0,
                last_commanded_kvar: 0.0,
                consecutive_write_failures: 0,
                inverter_fault: false,
                last_inverter: None,
                last_bms: None,
                last_tick: None,
            }),
            enabled: AtomicBool::new(false),
            setpoint_tx,
            setpoint_rx: Mutex::new(setpoint_rx),
            last_report: RwLock::new(None),
            upstream,
            advertised_endpoint: format!("http://{}:{}", cfg.server.host, cfg.server.port),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn is_emergency_stopped(&self) -> bool {
        self.safety.lock().await.is_emergency_stopped()
    }

    /// Queue a setpoint for the next tick. Always accepted into the channel;
    /// ordering and the safety envelope are enforced at apply time.
    pub async fn submit_setpoint(&self, setpoint: Setpoint) -> Result<()> {
        self.setpoint_tx
            .send(setpoint)
            .await
            .context("setpoint channel closed")
    }

    pub async fn control(&self, action: ControlAction) -> Result<()> {
        match action {
            ControlAction::Enable => self.enable().await,
            ControlAction::Disable => self.disable().await,
            ControlAction::ResetAlarms => self.reset_alarms().await,
            ControlAction::EmergencyStop => self.emergency_stop().await,
        }
    }

    pub async fn enable(&self) -> Result<()> {
        if self.safety.lock().await.is_emergency_stopped() {
            bail!("cannot enable: emergency stop active");
        }
        self.inverter
            .enable()
            .await
            .context("failed to enable inverter")?;
        self.enabled.store(true, Ordering::SeqCst);
        info!(node_id = %self.identity.node_id, "node enabled");
        Ok(())
    }

    pub async fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        self.inverter
            .disable()
            .await
            .context("failed to disable inverter")?;
        info!(node_id = %self.identity.node_id, "node disabled");
        Ok(())
    }

    pub async fn reset_alarms(&self) -> Result<()> {
        let now = Utc::now();
        let runtime = {
            let mut safety = self.safety.lock().await;
            safety.reset(now)?;
            safety.runtime()
        };
        {
            // Inverter fault is cleared with the alarms
            let mut tick = self.tick.write().await;
            tick.inverter_fault = false;
            tick.consecutive_write_failures = 0;
        }
        persist::store(&self.cfg.safety_state_file, runtime).await?;
        info!(node_id = %self.identity.node_id, "alarms reset");
        Ok(())
    }

    pub async fn emergency_stop(&self) -> Result<()> {
        let now = Utc::now();
        let runtime = {
            let mut safety = self.safety.lock().await;
            safety.trigger_emergency(now, "operator emergency stop");
            safety.runtime()
        };
        persist::store(&self.cfg.safety_state_file, runtime).await?;
        self.enabled.store(false, Ordering::SeqCst);
        self.ramp.lock().await.force(0.0);
        if let Err(e) = self.write_inverter(0.0, 0.0).await {
            error!(error = %e, "failed to zero inverter during emergency stop");
        }
        let _ = self.inverter.disable().await;
        self.tick.write().await.last_commanded_kw = 0.0;
        error!(node_id = %self.identity.node_id, "EMERGENCY STOP ACTIVATED");
        Ok(())
    }

    pub async fn recent_violations(&self, count: usize) -> Vec<SafetyViolation> {
        self.safety.lock().await.recent_violations(count)
    }

    /// Power actually commanded at the last tick
    pub async fn last_commanded_kw(&self) -> f64 {
        self.tick.read().await.last_commanded_kw
    }

    /// Simulation handle (None in hardware mode)
    pub fn simulated_bms(&self) -> Option<Arc<SimulatedBms>> {
        self.sim_bms.clone()
    }

    /// Simulation handle (None in hardware mode)
    pub fn simulated_inverter(&self) -> Option<Arc<SimulatedInverter>> {
        self.sim_inverter.clone()
    }

    pub async fn last_report(&self) -> Option<TelemetryReport> {
        self.last_report.read().await.clone()
    }

    /// One control tick: sample, check, merge setpoints, command
    pub async fn run_tick(&self, now: DateTime<Utc>) {
        let dt_s = {
            let tick = self.tick.read().await;
            tick.last_tick
                .map(|t| ((now - t).num_milliseconds() as f64 / 1000.0).max(0.001))
                .unwrap_or(self.cfg.tick_seconds as f64)
        };

        // 1. Sample hardware
        let inverter_state = match tokio::time::timeout(
            Duration::from_millis(self.cfg.inverter_timeout_ms),
            self.inverter.read_state(),
        )
        .await
        {
            Ok(Ok(state)) => Some(state),
            Ok(Err(e)) => {
                warn!(error = %e, "inverter read failed");
                None
            }
            Err(_) => {
                warn!("inverter read timed out");
                None
            }
        };

        let bms_reading = self.bms.latest().await;
        let bms_fresh = bms_reading.as_ref().map(|r| {
            let staleness = now - r.received_at;
            staleness <= ChronoDuration::milliseconds(3 * self.cfg.bms_frame_period_ms as i64)
        });
        if bms_fresh == Some(false) {
            warn!("BMS data stale, treating as missing");
        }
        let bms_usable = match bms_fresh {
            Some(true) => bms_reading.clone(),
            _ => None,
        };

        // 2. Safety evaluation on the normalized snapshot
        let sample = build_safety_sample(&bms_usable, &inverter_state);
        let runtime_before;
        let runtime_after;
        {
            let mut safety = self.safety.lock().await;
            runtime_before = safety.runtime();
            safety.check(&sample, now);
            runtime_after = safety.runtime();
        }
        if runtime_after.emergency_stopped != runtime_before.emergency_stopped
            || runtime_after.power_reduction_factor != runtime_before.power_reduction_factor
        {
            if let Err(e) = persist::store(&self.cfg.safety_state_file, runtime_after).await {
                error!(error = %e, "failed to persist safety state");
            }
        }

        // 3. Merge pending setpoints; most recent wins, ordered by (source, seq)
        {
            let mut rx = self.setpoint_rx.lock().await;
            let mut tick = self.tick.write().await;
            while let Ok(sp) = rx.try_recv() {
                let superseded = tick
                    .applied_seqs
                    .get(&sp.source_id)
                    .map_or(false, |last| sp.seq <= *last);
                if superseded {
                    debug!(source = %sp.source_id, seq = sp.seq, "dropping out-of-order setpoint");
                    continue;
                }
                tick.applied_seqs.insert(sp.source_id.clone(), sp.seq);
                tick.active_setpoint = Some(sp);
            }
            // Expire a held setpoint once past valid_until
            if let Some(sp) = &tick.active_setpoint {
                if !sp.is_fresh(now) {
                    debug!(source = %sp.source_id, seq = sp.seq, "setpoint expired, commanding 0");
                    tick.active_setpoint = None;
                }
            }
        }

        // 4. Compute the safe command
        let (target_kw, target_kvar) = {
            let tick = self.tick.read().await;
            if !self.is_enabled() || tick.inverter_fault {
                (0.0, 0.0)
            } else {
                tick.active_setpoint
                    .as_ref()
                    .map(|sp| (sp.target_kw, sp.target_kvar))
                    .unwrap_or((0.0, 0.0))
            }
        };

        let (safe_kw, latched) = {
            let safety = self.safety.lock().await;
            let mut safe = safety.apply_limits(target_kw, self.identity.rated_power_kw);
            // Direction-aware SOC gate: never discharge a depleted pack or
            // charge past the configured ceiling, whatever was commanded
            if let Some(soc) = bms_usable.as_ref().map(|r| r.pack.soc_percent) {
                if safe < 0.0 && soc <= crate::domain::derating::SOC_DISCHARGE_FLOOR {
                    debug!(soc, "discharge inhibited at low SOC");
                    safe = 0.0;
                }
                if safe > 0.0 && soc >= safety.limits().max_soc_percent {
                    debug!(soc, "charge inhibited at high SOC");
                    safe = 0.0;
                }
            }
            (safe, safety.is_emergency_stopped())
        };

        let commanded_kw = {
            let mut ramp = self.ramp.lock().await;
            if latched {
                // The latch overrides any in-flight transition immediately
                ramp.force(0.0);
                0.0
            } else {
                ramp.step(safe_kw, dt_s)
            }
        };
        let commanded_kvar = if latched { 0.0 } else { target_kvar };

        // 5. Write to the inverter: one retry this tick, then degrade
        let write_result = match self.write_inverter(commanded_kw, commanded_kvar).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(error = %first, "inverter write failed, retrying once");
                self.write_inverter(commanded_kw, commanded_kvar).await
            }
        };

        {
            let mut tick = self.tick.write().await;
            match write_result {
                Ok(()) => {
                    tick.consecutive_write_failures = 0;
                    tick.last_commanded_kw = commanded_kw;
                    tick.last_commanded_kvar = commanded_kvar;
                }
                Err(e) => {
                    tick.consecutive_write_failures += 1;
                    warn!(
                        error = %e,
                        failures = tick.consecutive_write_failures,
                        "inverter write failed twice this tick"
                    );
                    if tick.consecutive_write_failures >= self.cfg.inverter_fault_threshold
                        && !tick.inverter_fault
                    {
                        tick.inverter_fault = true;
                        self.safety.lock().await.force_stop(
                            now,
                            "inverter_fault",
                            "inverter unresponsive, requesting stop",
                        );
                    }
                }
            }
            tick.last_inverter = inverter_state.clone();
            tick.last_bms = bms_reading.clone();
            tick.last_tick = Some(now);
        }

        // Advance the simulated pack with what was actually commanded
        if let Some(sim) = &self.sim_bms {
            sim.apply_power(commanded_kw, dt_s).await;
        }

        // 6. Refresh the published snapshot
        let report = self.build_report(now).await;
        *self.last_report.write().await = Some(report);

        debug!(
            target_kw,
            safe_kw,
            commanded_kw,
            "control tick"
        );
    }

    async fn write_inverter(&self, power_kw: f64, power_kvar: f64) -> Result<()> {
        let timeout = Duration::from_millis(self.cfg.inverter_timeout_ms);
        tokio::time::timeout(timeout, self.inverter.set_power(power_kw))
            .await
            .context("inverter write timed out")??;
        // Reactive power is best-effort; a failure here does not degrade health
        if let Ok(Err(e)) =
            tokio::time::timeout(timeout, self.inverter.set_reactive_power(power_kvar)).await
        {
            debug!(error = %e, "reactive power write failed");
        }
        Ok(())
    }

    async fn build_report(&self, now: DateTime<Utc>) -> TelemetryReport {
        let tick = self.tick.read().await;
        let safety = self.safety.lock().await;

        let bms = tick.last_bms.as_ref();
        let inverter = tick.last_inverter.as_ref();
        let pack = bms.map(|r| &r.pack);
        let alarms = bms.map(|r| r.alarms);

        TelemetryReport {
            node_id: self.identity.node_id.clone(),
            campus_id: self.identity.campus_id.clone(),
            ts: now,
            soc: pack.map(|p| p.soc_percent),
            soh: pack.map(|p| p.soh_percent),
            voltage: pack.map(|p| p.pack_voltage_v),
            current: pack.map(|p| p.pack_current_a),
            temperature: pack.map(|p| p.temperature_c),
            power_kw: inverter.map(|i| i.ac_power_kw),
            reactive_power_kvar: inverter.map(|i| i.reactive_power_kvar),
            frequency: inverter.map(|i| i.ac_frequency_hz),
            capacity_kwh: self.identity.energy_capacity_kwh,
            max_power_kw: self.identity.rated_power_kw,
            cycle_count: pack.map(|p| p.cycle_count),
            status: StatusFlags {
                enabled: self.is_enabled(),
                online: true,
                alarms_bitmask: alarms.map(|a| a.warning_bitmask()).unwrap_or(0),
                faults_bitmask: alarms.map(|a| a.fault_bitmask()).unwrap_or(0),
            },
            bms: pack.map(|p| BmsTelemetry {
                pack_voltage: p.pack_voltage_v,
                pack_current: p.pack_current_a,
                min_cell_voltage: p.min_cell_voltage().unwrap_or(0.0),
                max_cell_voltage: p.max_cell_voltage().unwrap_or(0.0),
                voltage_delta: p.voltage_delta().unwrap_or(0.0),
                max_cell_temperature: p.max_cell_temperature(),
                is_balanced: p.is_balanced(),
                num_cells: p.cells.len(),
                critical_fault: alarms.map(|a| a.has_critical_fault()).unwrap_or(false),
                warnings: alarms.map(|a| a.has_warnings()).unwrap_or(false),
            }),
            inverter: inverter.map(|i| InverterTelemetry {
                ac_power_kw: i.ac_power_kw,
                ac_voltage: i.ac_voltage_v,
                ac_current: i.ac_current_a,
                ac_frequency: i.ac_frequency_hz,
                dc_voltage: i.dc_voltage_v,
                dc_current: i.dc_current_a,
                efficiency: i.efficiency_percent,
                temperature: i.temperature_c,
                status: i.status.to_string(),
            }),
            safety: SafetyTelemetry {
                emergency_stopped: safety.is_emergency_stopped(),
                power_reduction_factor: safety.power_reduction_factor(),
                violations: safety.recent_violations(10),
            },
        }
    }

    async fn register_with_campus(&self) {
        let Some(upstream) = &self.upstream else {
            return;
        };
        match upstream
            .register_node(&self.identity, &self.advertised_endpoint)
            .await
        {
            Ok(()) => info!(node_id = %self.identity.node_id, "registered with campus"),
            Err(e) => warn!(error = %e, "campus registration failed, will rely on polling"),
        }
    }

    async fn publish_telemetry(&self) {
        let Some(upstream) = &self.upstream else {
            return;
        };
        let Some(report) = self.last_report().await else {
            return;
        };
        if let Err(e) = upstream.publish_telemetry(&report).await {
            warn!(error = %e, "telemetry publish failed");
        }
    }
}

fn build_safety_sample(
    bms: &Option<BmsReading>,
    inverter: &Option<InverterState>,
) -> SafetySample {
    SafetySample {
        soc_percent: bms.as_ref().map(|r| r.pack.soc_percent),
        soh_percent: bms.as_ref().map(|r| r.pack.soh_percent),
        pack_voltage_v: bms.as_ref().map(|r| r.pack.pack_voltage_v),
        pack_current_a: bms.as_ref().map(|r| r.pack.pack_current_a),
        temperature_c: bms.as_ref().map(|r| r.pack.temperature_c),
        power_kw: inverter.as_ref().map(|i| i.ac_power_kw),
        cells: bms.as_ref().map(|r| r.pack.cells.clone()).unwrap_or_default(),
        alarms: bms.as_ref().map(|r| r.alarms),
    }
}

type Hardware = (
    Arc<dyn Inverter>,
    Arc<dyn BmsSource>,
    Option<Arc<SimulatedBms>>,
    Option<Arc<SimulatedInverter>>,
);

async fn build_hardware(cfg: &NodeConfig) -> Result<Hardware> {
    match cfg.hardware {
        HardwareMode::Simulated => {
            let sim_inverter = Arc::new(SimulatedInverter::new(cfg.rated_power_kw));
            let sim_bms = Arc::new(SimulatedBms::new(16, cfg.energy_capacity_kwh, 80.0));
            Ok((
                Arc::clone(&sim_inverter) as Arc<dyn Inverter>,
                Arc::clone(&sim_bms) as Arc<dyn BmsSource>,
                Some(sim_bms),
                Some(sim_inverter),
            ))
        }
        HardwareMode::Modbus => {
            #[cfg(feature = "modbus")]
            {
                let modbus_cfg = cfg
                    .modbus
                    .as_ref()
                    .context("hardware mode is modbus but [node.modbus] is missing")?;
                let inverter = Arc::new(
                    crate::hardware::sunspec::SunSpecInverter::connect(
                        modbus_cfg,
                        cfg.rated_power_kw,
                    )
                    .await?,
                );
                let bms = Arc::new(
                    crate::hardware::modbus::ModbusBessSource::connect(modbus_cfg).await?,
                );
                Ok((
                    inverter as Arc<dyn Inverter>,
                    bms as Arc<dyn BmsSource>,
                    None,
                    None,
                ))
            }
            #[cfg(not(feature = "modbus"))]
            {
                bail!("hardware mode is modbus but the binary was built without the modbus feature")
            }
        }
    }
}

pub fn spawn_node_tasks(state: NodeState, cfg: &Config) {
    let controller = Arc::clone(&state.controller);
    let tick_seconds = cfg.node.tick_seconds.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_seconds));
        loop {
            interval.tick().await;
            controller.run_tick(Utc::now()).await;
        }
    });

    let controller = Arc::clone(&state.controller);
    tokio::spawn(async move {
        controller.register_with_campus().await;
    });

    let controller = Arc::clone(&state.controller);
    let publish_seconds = cfg.node.telemetry_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(publish_seconds));
        loop {
            interval.tick().await;
            controller.publish_telemetry().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Role, ServerConfig};

    fn test_config() -> Config {
        AppConfig {
            role: Role::Node,
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                request_timeout_secs: 30,
                enable_cors: false,
            },
            node: NodeConfig {
                safety_state_file: std::env::temp_dir()
                    .join(format!("vpp-test-{}.json", uuid::Uuid::new_v4())),
                ramp_kw_per_s: 1000.0,
                ..NodeConfig::default()
            },
            safety: SafetyConfig::default(),
            campus: Default::default(),
            frequency: Default::default(),
            droop: Default::default(),
            pmu: Default::default(),
            telemetry: Default::default(),
        }
    }

    fn setpoint(source: &str, seq: u64, kw: f64, now: DateTime<Utc>) -> Setpoint {
        Setpoint {
            target_kw: kw,
            target_kvar: 0.0,
            valid_until: now + ChronoDuration::seconds(30),
            reason: "test".to_string(),
            source_id: source.to_string(),
            seq,
        }
    }

    #[tokio::test]
    async fn later_sequence_wins_regardless_of_arrival_order() {
        let cfg = test_config();
        let nc = NodeController::new(&cfg).await.unwrap();
        nc.enable().await.unwrap();

        let now = Utc::now();
        nc.submit_setpoint(setpoint("campus", 2, 40.0, now)).await.unwrap();
        nc.submit_setpoint(setpoint("campus", 1, 80.0, now)).await.unwrap();
        nc.run_tick(now).await;

        let tick = nc.tick.read().await;
        assert_eq!(tick.active_setpoint.as_ref().unwrap().seq, 2);
        assert_eq!(tick.last_commanded_kw, 40.0);
    }

    #[tokio::test]
    async fn expired_setpoint_commands_zero() {
        let cfg = test_config();
        let nc = NodeController::new(&cfg).await.unwrap();
        nc.enable().await.unwrap();

        let now = Utc::now();
        let mut sp = setpoint("campus", 1, 50.0, now);
        sp.valid_until = now - ChronoDuration::seconds(1);
        nc.submit_setpoint(sp).await.unwrap();
        nc.run_tick(now).await;

        assert_eq!(nc.tick.read().await.last_commanded_kw, 0.0);
    }

    #[tokio::test]
    async fn disabled_node_holds_zero() {
        let cfg = test_config();
        let nc = NodeController::new(&cfg).await.unwrap();

        let now = Utc::now();
        nc.submit_setpoint(setpoint("campus", 1, 50.0, now)).await.unwrap();
        nc.run_tick(now).await;

        assert_eq!(nc.tick.read().await.last_commanded_kw, 0.0);
    }

    #[tokio::test]
    async fn emergency_stop_overrides_pending_setpoint() {
        let cfg = test_config();
        let nc = NodeController::new(&cfg).await.unwrap();
        nc.enable().await.unwrap();

        nc.emergency_stop().await.unwrap();
        let now = Utc::now();
        nc.submit_setpoint(setpoint("campus", 1, 100.0, now)).await.unwrap();
        nc.run_tick(now).await;

        assert_eq!(nc.tick.read().await.last_commanded_kw, 0.0);
        assert!(nc.is_emergency_stopped().await);
    }

    #[tokio::test]
    async fn repeated_write_failures_mark_fault_and_stop() {
        let cfg = test_config();
        let nc = NodeController::new(&cfg).await.unwrap();
        nc.enable().await.unwrap();

        // Each tick retries once; 5 failed ticks trips the default threshold
        nc.sim_inverter
            .as_ref()
            .unwrap()
            .fail_next_writes(u32::MAX)
            .await;

        let now = Utc::now();
        for i in 0..5 {
            nc.run_tick(now + ChronoDuration::seconds(i)).await;
        }

        let tick = nc.tick.read().await;
        assert!(tick.inverter_fault);
        drop(tick);
        let violations = nc.recent_violations(10).await;
        assert!(violations.iter().any(|v| v.category == "inverter_fault"));
    }

    #[tokio::test]
    async fn telemetry_report_has_schema_fields() {
        let cfg = test_config();
        let nc = NodeController::new(&cfg).await.unwrap();
        nc.enable().await.unwrap();
        nc.run_tick(Utc::now()).await;

        let report = nc.last_report().await.unwrap();
        assert_eq!(report.node_id, cfg.node.node_id);
        assert!(report.soc.is_some());
        assert!(report.bms.is_some());
        assert!(report.inverter.is_some());
        assert!(!report.safety.emergency_stopped);

        let json = serde_json::to_value(&report).unwrap();
        for key in [
            "node_id", "campus_id", "ts", "soc", "soh", "voltage", "current",
            "temperature", "power_kw", "reactive_power_kvar", "frequency",
            "capacity_kwh", "max_power_kw", "cycle_count", "status", "bms",
            "inverter", "safety",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }
}
