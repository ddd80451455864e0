#![allow(dead_code)]
//! Grid frequency monitor with IEGC band classification
//!
//! Maintains a rolling window of PMU samples, classifies the current
//! frequency into a band, and raises/clears alarms. The monitor never
//! commands; it only classifies for the droop controller to consume.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{error, info, warn};

use crate::config::FrequencyConfig;
use crate::grid::pmu::PmuSample;

/// IEGC frequency band
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FrequencyBand {
    CriticalLow,
    Low,
    Normal,
    High,
    CriticalHigh,
}

impl FrequencyBand {
    pub fn is_critical(&self) -> bool {
        matches!(self, FrequencyBand::CriticalLow | FrequencyBand::CriticalHigh)
    }
}

/// Rolling statistics over the monitor window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyStats {
    pub current_hz: f64,
    pub mean_hz: f64,
    pub min_hz: f64,
    pub max_hz: f64,
    pub std_dev_hz: f64,
    pub sample_count: usize,
    pub band: FrequencyBand,
    pub in_alarm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm_reason: Option<String>,
}

/// A band change emitted by `update`
#[derive(Debug, Clone, PartialEq)]
pub struct BandTransition {
    pub from: FrequencyBand,
    pub to: FrequencyBand,
    pub at: DateTime<Utc>,
    pub f_hz: f64,
}

pub struct FrequencyMonitor {
    cfg: FrequencyConfig,
    window: Duration,
    /// (timestamp, frequency, rocof), bounded to the stats window
    ring: VecDeque<(DateTime<Utc>, f64, f64)>,
    capacity: usize,
    current_hz: f64,
    band: FrequencyBand,
    in_alarm: bool,
    alarm_reason: Option<String>,
}

impl FrequencyMonitor {
    pub fn new(cfg: FrequencyConfig) -> Self {
        let capacity =
            (cfg.stats_window_secs as f64 * cfg.sample_rate_hz).ceil().max(1.0) as usize;
        let window = Duration::seconds(cfg.stats_window_secs as i64);
        let nominal = (cfg.normal_min_hz + cfg.normal_max_hz) / 2.0;
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
            current_hz: nominal,
            band: FrequencyBand::Normal,
            in_alarm: false,
            alarm_reason: None,
            window,
            cfg,
        }
    }

    pub fn classify(&self, f_hz: f64) -> FrequencyBand {
        if f_hz < self.cfg.critical_low_hz {
            FrequencyBand::CriticalLow
        } else if f_hz < self.cfg.normal_min_hz {
            FrequencyBand::Low
        } else if f_hz <= self.cfg.normal_max_hz {
            FrequencyBand::Normal
        } else if f_hz <= self.cfg.critical_high_hz {
            FrequencyBand::High
        } else {
            FrequencyBand::CriticalHigh
        }
    }

    /// Ingest one sample; returns the band transition if one occurred
    pub fn update(&mut self, sample: &PmuSample) -> Option<BandTransition> {
        self.current_hz = sample.f_hz;

        self.ring
            .push_back((sample.ts, sample.f_hz, sample.rocof_hz_per_s));
        while self.ring.len() > self.capacity {
            self.ring.pop_front();
        }
        // Also drop entries older than the window; the ring is sized for the
        // nominal rate but the stream may jitter
        let cutoff = sample.ts - self.window;
        while let Some((ts, _, _)) = self.ring.front() {
            if *ts < cutoff {
                self.ring.pop_front();
            } else {
                break;
            }
        }

        if sample.rocof_hz_per_s.abs() > 1.0 {
            warn!(rocof = sample.rocof_hz_per_s, "high ROCOF observed");
        }

        let new_band = self.classify(sample.f_hz);
        self.update_alarm(new_band, sample.f_hz);

        if new_band != self.band {
            let transition = BandTransition {
                from: self.band,
                to: new_band,
                at: sample.ts,
                f_hz: sample.f_hz,
            };
            info!(from = %transition.from, to = %transition.to, f_hz = sample.f_hz, "frequency band transition");
            self.band = new_band;
            return Some(transition);
        }
        None
    }

    fn update_alarm(&mut self, band: FrequencyBand, f_hz: f64) {
        match band {
            FrequencyBand::CriticalLow => {
                self.in_alarm = true;
                self.alarm_reason = Some(format!("CRITICAL LOW FREQUENCY: {:.3} Hz", f_hz));
                error!("{}", self.alarm_reason.as_deref().unwrap_or_default());
            }
            FrequencyBand::CriticalHigh => {
                self.in_alarm = true;
                self.alarm_reason = Some(format!("CRITICAL HIGH FREQUENCY: {:.3} Hz", f_hz));
                error!("{}", self.alarm_reason.as_deref().unwrap_or_default());
            }
            FrequencyBand::Low => {
                self.in_alarm = true;
                self.alarm_reason = Some(format!(
                    "Low frequency: {:.3} Hz (below {:.2} Hz)",
                    f_hz, self.cfg.normal_min_hz
                ));
            }
            FrequencyBand::High => {
                self.in_alarm = true;
                self.alarm_reason = Some(format!(
                    "High frequency: {:.3} Hz (above {:.2} Hz)",
                    f_hz, self.cfg.normal_max_hz
                ));
            }
            FrequencyBand::Normal => {
                if self.in_alarm {
                    info!(f_hz, "frequency returned to normal");
                }
                self.in_alarm = false;
                self.alarm_reason = None;
            }
        }
    }

    pub fn band(&self) -> FrequencyBand {
        self.band
    }

    pub fn current_hz(&self) -> f64 {
        self.current_hz
    }

    pub fn in_alarm(&self) -> bool {
        self.in_alarm
    }

    /// True iff the current frequency is outside the normal band
    pub fn requires_response(&self) -> bool {
        self.current_hz < self.cfg.normal_min_hz || self.current_hz > self.cfg.normal_max_hz
    }

    pub fn stats(&self) -> FrequencyStats {
        let freqs: Vec<f64> = self.ring.iter().map(|(_, f, _)| *f).collect();
        let count = freqs.len();
        let (mean, min, max, std_dev) = if count > 0 {
            let mean = freqs.iter().sum::<f64>() / count as f64;
            let min = freqs.iter().cloned().reduce(f64::min).unwrap_or(mean);
            let max = freqs.iter().cloned().reduce(f64::max).unwrap_or(mean);
            let variance =
                freqs.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / count as f64;
            (mean, min, max, variance.sqrt())
        } else {
            (self.current_hz, self.current_hz, self.current_hz, 0.0)
        };

        FrequencyStats {
            current_hz: self.current_hz,
            mean_hz: mean,
            min_hz: min,
            max_hz: max,
            std_dev_hz: std_dev,
            sample_count: count,
            band: self.band,
            in_alarm: self.in_alarm,
            alarm_reason: self.alarm_reason.clone(),
        }
    }
}
