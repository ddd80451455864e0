#![allow(dead_code)]
//! Primary frequency droop controller
//!
//! Converts PMU samples into a power response command:
//!
//! ```text
//! dP = - (P_max / droop) * (df / f_nominal)
//! ```
//!
//! Sign convention here is physical: positive = discharge (inject into the
//! grid), negative = charge (absorb). Low frequency therefore produces a
//! positive response. The campus and node tiers use the opposite wire sign
//! (positive = charge); the dispatcher flips at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::config::DroopConfig;
use crate::domain::derating::{soc_scale, temperature_scale, PowerDirection};
use crate::grid::monitor::FrequencyBand;
use crate::grid::pmu::PmuSample;
use crate::safety::RampLimiter;

/// Frequency response modes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ResponseMode {
    /// No response
    Off,
    /// Primary response (0-5 seconds)
    Primary,
    /// Secondary response (30s-15min, AGC-based)
    Secondary,
    /// Tertiary response (15min+, market-based)
    Tertiary,
}

/// Droop controller settings, config-bound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroopSettings {
    pub droop_percent: f64,
    pub deadband_low_hz: f64,
    pub deadband_high_hz: f64,
    pub f_nominal_hz: f64,
    pub max_power_kw: f64,
    pub ramp_rate_kw_per_s: f64,
    pub enable_damping: bool,
    pub damping_gain: f64,
    pub mode: ResponseMode,
}

impl DroopSettings {
    pub fn from_config(cfg: &DroopConfig) -> anyhow::Result<Self> {
        let mode = ResponseMode::from_str(&cfg.mode)
            .map_err(|_| anyhow::anyhow!("unknown response mode: {}", cfg.mode))?;
        Ok(Self {
            droop_percent: cfg.droop_percent,
            deadband_low_hz: cfg.deadband_low_hz,
            deadband_high_hz: cfg.deadband_high_hz,
            f_nominal_hz: cfg.f_nominal_hz,
            max_power_kw: cfg.max_power_kw,
            ramp_rate_kw_per_s: cfg.ramp_rate_kw_per_s,
            enable_damping: cfg.enable_damping,
            damping_gain: cfg.damping_gain,
            mode,
        })
    }
}

/// Controller status snapshot for the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroopStatus {
    pub enabled: bool,
    pub mode: ResponseMode,
    pub current_setpoint_kw: f64,
    pub last_frequency_hz: f64,
    pub settings: DroopSettings,
}

pub struct DroopController {
    settings: DroopSettings,
    enabled: bool,
    ramp: RampLimiter,
    last_sample_ts: Option<DateTime<Utc>>,
    last_frequency: f64,
}

impl DroopController {
    pub fn new(settings: DroopSettings) -> Self {
        let nominal = settings.f_nominal_hz;
        Self {
            ramp: RampLimiter::new(settings.ramp_rate_kw_per_s),
            enabled: false,
            last_sample_ts: None,
            last_frequency: nominal,
            settings,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        info!("frequency droop controller enabled");
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.ramp.force(0.0);
        info!("frequency droop controller disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn settings(&self) -> &DroopSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: DroopSettings) {
        info!(?settings, "droop controller settings updated");
        self.ramp = RampLimiter::with_initial(settings.ramp_rate_kw_per_s, self.ramp.last_kw());
        self.settings = settings;
    }

    pub fn status(&self) -> DroopStatus {
        DroopStatus {
            enabled: self.enabled,
            mode: self.settings.mode,
            current_setpoint_kw: self.ramp.last_kw(),
            last_frequency_hz: self.last_frequency,
            settings: self.settings.clone(),
        }
    }

    /// Compute the power response for one PMU sample
    ///
    /// `stream_valid` is false when the PMU feed has gone stale (gap past the
    /// hold budget); the command is then 0 regardless of the last frequency.
    /// SOC and temperature derate the response multiplicatively.
    pub fn compute(
        &mut self,
        sample: &PmuSample,
        stream_valid: bool,
        soc_percent: Option<f64>,
        temperature_c: Option<f64>,
    ) -> f64 {
        let dt_s = self
            .last_sample_ts
            .map(|t| ((sample.ts - t).num_milliseconds() as f64 / 1000.0).max(0.001))
            .unwrap_or(1.0);
        self.last_sample_ts = Some(sample.ts);
        self.last_frequency = sample.f_hz;

        if !self.enabled
            || self.settings.mode == ResponseMode::Off
            || !sample.sync_locked
            || !sample.data_valid
            || !stream_valid
        {
            self.ramp.force(0.0);
            return 0.0;
        }

        // Deadband hold: no response, and consecutive in-band samples are
        // idempotent regardless of ROCOF
        if sample.f_hz >= self.settings.deadband_low_hz
            && sample.f_hz <= self.settings.deadband_high_hz
        {
            self.ramp.force(0.0);
            return 0.0;
        }

        let freq_deviation = sample.f_hz - self.settings.f_nominal_hz;
        let droop_fraction = self.settings.droop_percent / 100.0;

        // Low frequency -> positive power (discharge), high -> negative
        let mut response = -(self.settings.max_power_kw / droop_fraction)
            * (freq_deviation / self.settings.f_nominal_hz);

        // ROCOF damping helps arrest the decline/rise
        if self.settings.enable_damping {
            response += -self.settings.damping_gain
                * sample.rocof_hz_per_s
                * self.settings.max_power_kw;
        }

        response = response.clamp(-self.settings.max_power_kw, self.settings.max_power_kw);

        // Adaptive derating by battery state
        let direction = if response > 0.0 {
            PowerDirection::Discharge
        } else {
            PowerDirection::Charge
        };
        if let Some(soc) = soc_percent {
            response *= soc_scale(direction, soc);
        }
        if let Some(temperature) = temperature_c {
            response *= temperature_scale(temperature);
        }

        let commanded = self.ramp.step(response, dt_s);

        if commanded.abs() > 10.0 {
            info!(
                f_hz = sample.f_hz,
                df = freq_deviation,
                target_kw = response,
                commanded_kw = commanded,
                "frequency response"
            );
        } else {
            debug!(
                f_hz = sample.f_hz,
                target_kw = response,
                commanded_kw = commanded,
                "frequency response"
            );
        }

        commanded
    }

    /// Rated-magnitude command for the emergency fan-out path
    ///
    /// Positive (discharge) for CRITICAL_LOW, negative for CRITICAL_HIGH.
    pub fn emergency_command(&self, band: FrequencyBand) -> Option<f64> {
        match band {
            FrequencyBand::CriticalLow => Some(self.settings.max_power_kw),
            FrequencyBand::CriticalHigh => Some(-self.settings.max_power_kw),
            _ => None,
        }
    }
}

/// IEGC compliance checks: internal, non-gating
///
/// Deviations are logged but never alter the control output.
pub struct ComplianceChecker {
    event_started: Option<DateTime<Utc>>,
    responded: bool,
}

impl ComplianceChecker {
    pub fn new() -> Self {
        Self {
            event_started: None,
            responded: false,
        }
    }

    /// Track band changes; an excursion out of NORMAL starts the clock
    pub fn on_band(&mut self, band: FrequencyBand, now: DateTime<Utc>) {
        match band {
            FrequencyBand::Normal => {
                self.event_started = None;
                self.responded = false;
            }
            _ => {
                if self.event_started.is_none() {
                    self.event_started = Some(now);
                    self.responded = false;
                }
            }
        }
    }

    /// Track commands; the first non-zero response closes the clock
    pub fn on_command(&mut self, commanded_kw: f64, now: DateTime<Utc>) {
        if self.responded || commanded_kw.abs() < f64::EPSILON {
            return;
        }
        if let Some(started) = self.event_started {
            self.responded = true;
            let delay_s = (now - started).num_milliseconds() as f64 / 1000.0;
            if delay_s <= 5.0 {
                info!(delay_s, "IEGC response time compliant (<= 5 s)");
            } else {
                warn!(delay_s, "IEGC response time NON-compliant (> 5 s)");
            }
        }
    }

    /// Compare the settled response against the droop law, +-5 % tolerance
    pub fn check_droop_accuracy(
        f_hz: f64,
        actual_kw: f64,
        settings: &DroopSettings,
    ) -> bool {
        let droop_fraction = settings.droop_percent / 100.0;
        let expected = -(settings.max_power_kw / droop_fraction)
            * ((f_hz - settings.f_nominal_hz) / settings.f_nominal_hz);
        let tolerance = expected.abs() * 0.05;
        let error = (actual_kw - expected).abs();
        if error <= tolerance {
            debug!(error_kw = error, "droop response within tolerance");
            true
        } else {
            warn!(
                expected_kw = expected,
                actual_kw, error_kw = error, "droop response outside 5% tolerance"
            );
            false
        }
    }
}

impl Default for ComplianceChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::pmu::GridZone;
    use chrono::Duration;

    fn settings() -> DroopSettings {
        DroopSettings {
            droop_percent: 5.0,
            deadband_low_hz: 49.90,
            deadband_high_hz: 50.05,
            f_nominal_hz: 50.0,
            max_power_kw: 1000.0,
            ramp_rate_kw_per_s: 100.0,
            enable_damping: false,
            damping_gain: 0.1,
            mode: ResponseMode::Primary,
        }
    }

    fn sample(f_hz: f64, rocof: f64, ts: DateTime<Utc>) -> PmuSample {
        PmuSample {
            ts,
            f_hz,
            rocof_hz_per_s: rocof,
            sync_locked: true,
            data_valid: true,
            zone: GridZone::Western,
            substation: "test".to_string(),
        }
    }

    fn enabled_controller() -> DroopController {
        let mut controller = DroopController::new(settings());
        controller.enable();
        controller
    }

    #[test]
    fn disabled_controller_commands_zero() {
        let mut c = DroopController::new(settings());
        let cmd = c.compute(&sample(49.50, 0.0, Utc::now()), true, None, None);
        assert_eq!(cmd, 0.0);
    }

    #[test]
    fn deadband_commands_zero_regardless_of_rocof() {
        let mut c = enabled_controller();
        let now = Utc::now();
        let first = c.compute(&sample(49.95, 2.0, now), true, None, None);
        let second = c.compute(
            &sample(49.95, -3.0, now + Duration::milliseconds(100)),
            true,
            None,
            None,
        );
        assert_eq!(first, 0.0);
        assert_eq!(second, 0.0);
    }

    #[test]
    fn low_frequency_ramps_toward_derated_target() {
        // Seed scenario: f=49.80 => base +80 kW; SOC 70 => x0.7 = 56 kW;
        // 25 C => x1.0; ramp 100 kW/s at dt 0.1 s => 10 kW steps
        let mut c = enabled_controller();
        let start = Utc::now();
        assert_eq!(
            c.compute(&sample(49.95, 0.0, start), true, Some(70.0), Some(25.0)),
            0.0
        );

        let mut ts = start;
        let mut cmd = 0.0;
        for i in 1..=6 {
            ts = start + Duration::milliseconds(100 * i);
            cmd = c.compute(&sample(49.80, 0.0, ts), true, Some(70.0), Some(25.0));
            if i == 1 {
                assert!((cmd - 10.0).abs() < 1e-9, "first step should be 10, got {cmd}");
            }
        }
        assert!((cmd - 56.0).abs() < 1e-9, "settled at 56 kW, got {cmd}");
    }

    #[test]
    fn droop_sign_convention() {
        let mut c = enabled_controller();
        let now = Utc::now();
        // Below nominal, outside deadband: discharge (positive)
        let low = c.compute(&sample(49.80, 0.0, now), true, None, None);
        assert!(low > 0.0);

        let mut c = enabled_controller();
        // Above nominal: charge (negative)
        let high = c.compute(&sample(50.20, 0.0, now), true, None, None);
        assert!(high < 0.0);
    }

    #[test]
    fn response_clamped_to_max_power() {
        let mut c = enabled_controller();
        // Huge deviation would exceed P_max before the clamp; disable ramp
        // effects by advancing far in time
        let now = Utc::now();
        c.compute(&sample(49.95, 0.0, now), true, None, None);
        // f = 47.0 -> base would be 1200 kW before the clamp
        let cmd = c.compute(
            &sample(47.0, 0.0, now + Duration::seconds(100)),
            true,
            None,
            None,
        );
        assert_eq!(cmd, 1000.0);
    }

    #[test]
    fn damping_adds_rocof_term() {
        let mut with = DroopController::new(DroopSettings {
            enable_damping: true,
            ..settings()
        });
        with.enable();
        let mut without = enabled_controller();

        let now = Utc::now();
        // Large dt so the ramp does not mask the difference
        with.compute(&sample(49.95, 0.0, now), true, None, None);
        without.compute(&sample(49.95, 0.0, now), true, None, None);
        let later = now + Duration::seconds(100);
        // Falling frequency (negative ROCOF) increases the injection
        let damped = with.compute(&sample(49.80, -0.5, later), true, None, None);
        let plain = without.compute(&sample(49.80, -0.5, later), true, None, None);
        assert!(damped > plain);
        assert!((damped - (80.0 + 0.1 * 0.5 * 1000.0)).abs() < 1e-6);
    }

    #[test]
    fn invalid_stream_zeroes_command() {
        let mut c = enabled_controller();
        let now = Utc::now();
        c.compute(&sample(49.95, 0.0, now), true, None, None);
        c.compute(&sample(49.70, 0.0, now + Duration::seconds(10)), true, None, None);

        // Stream goes stale: command 0 regardless of the last frequency
        let cmd = c.compute(
            &sample(49.70, 0.0, now + Duration::seconds(20)),
            false,
            None,
            None,
        );
        assert_eq!(cmd, 0.0);
    }

    #[test]
    fn unsynced_sample_zeroes_command() {
        let mut c = enabled_controller();
        let mut s = sample(49.70, 0.0, Utc::now());
        s.sync_locked = false;
        assert_eq!(c.compute(&s, true, None, None), 0.0);
    }

    #[test]
    fn soc_extremes_zero_one_direction() {
        let now = Utc::now();
        // Discharge request at SOC <= 20 is zeroed
        let mut c = enabled_controller();
        c.compute(&sample(49.95, 0.0, now), true, Some(15.0), Some(25.0));
        let cmd = c.compute(
            &sample(49.80, 0.0, now + Duration::seconds(100)),
            true,
            Some(15.0),
            Some(25.0),
        );
        assert_eq!(cmd, 0.0);

        // Charge request at SOC >= 80 is zeroed
        let mut c = enabled_controller();
        c.compute(&sample(49.95, 0.0, now), true, Some(85.0), Some(25.0));
        let cmd = c.compute(
            &sample(50.20, 0.0, now + Duration::seconds(100)),
            true,
            Some(85.0),
            Some(25.0),
        );
        assert_eq!(cmd, 0.0);
    }

    #[test]
    fn hot_pack_derates_response() {
        let now = Utc::now();
        let mut c = enabled_controller();
        c.compute(&sample(49.95, 0.0, now), true, Some(90.0), Some(55.0));
        let cmd = c.compute(
            &sample(49.80, 0.0, now + Duration::seconds(100)),
            true,
            Some(90.0),
            Some(55.0),
        );
        // base 80 x soc 1.0 x temp 0.2 = 16
        assert!((cmd - 16.0).abs() < 1e-9);
    }

    #[test]
    fn ramp_bound_holds_across_updates() {
        let mut c = enabled_controller();
        let start = Utc::now();
        let mut last = c.compute(&sample(49.95, 0.0, start), true, None, None);
        for i in 1..=50 {
            let ts = start + Duration::milliseconds(100 * i);
            let f = 49.95 - 0.01 * i as f64;
            let cmd = c.compute(&sample(f.max(49.0), 0.0, ts), true, None, None);
            assert!(
                (cmd - last).abs() <= 100.0 * 0.1 + 1e-9,
                "ramp bound violated: {last} -> {cmd}"
            );
            last = cmd;
        }
    }

    #[test]
    fn emergency_command_signs() {
        let c = enabled_controller();
        assert_eq!(c.emergency_command(FrequencyBand::CriticalLow), Some(1000.0));
        assert_eq!(
            c.emergency_command(FrequencyBand::CriticalHigh),
            Some(-1000.0)
        );
        assert_eq!(c.emergency_command(FrequencyBand::Low), None);
    }

    #[test]
    fn droop_accuracy_check() {
        let s = settings();
        assert!(ComplianceChecker::check_droop_accuracy(49.80, 80.0, &s));
        assert!(ComplianceChecker::check_droop_accuracy(49.80, 82.0, &s));
        assert!(!ComplianceChecker::check_droop_accuracy(49.80, 90.0, &s));
    }

    #[test]
    fn response_time_tracking() {
        let mut checker = ComplianceChecker::new();
        let t0 = Utc::now();
        checker.on_band(FrequencyBand::Low, t0);
        // First non-zero command 2 s later: compliant path, no panic
        checker.on_command(0.0, t0 + Duration::seconds(1));
        checker.on_command(25.0, t0 + Duration::seconds(2));
        // Returning to normal clears the event
        checker.on_band(FrequencyBand::Normal, t0 + Duration::seconds(30));
        assert!(checker.event_started.is_none());
    }
}
