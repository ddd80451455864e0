#![allow(dead_code)]
//! PMU stream: high-rate grid frequency measurements
//!
//! In production this would consume an IEEE C37.118 synchrophasor feed; the
//! simulated source generates a mean-reverting random walk with occasional
//! grid events so the droop controller can be exercised end to end.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Grid zones (regional grid operator areas)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GridZone {
    Northern,
    Eastern,
    Western,
    Southern,
    NorthEastern,
}

/// One PMU measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmuSample {
    pub ts: DateTime<Utc>,
    pub f_hz: f64,
    pub rocof_hz_per_s: f64,
    /// GPS sync status
    pub sync_locked: bool,
    pub data_valid: bool,
    pub zone: GridZone,
    pub substation: String,
}

/// Source of PMU samples; single-producer, single-consumer per controller
#[async_trait]
pub trait PmuSource: Send + Sync {
    async fn sample(&self) -> Option<PmuSample>;
}

/// Simulated PMU with realistic frequency variation
pub struct SimulatedPmu {
    state: Arc<Mutex<SimPmuState>>,
    nominal_hz: f64,
    zone: GridZone,
    substation: String,
}

struct SimPmuState {
    frequency: f64,
    trend: f64,
}

impl SimulatedPmu {
    pub fn new(nominal_hz: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimPmuState {
                frequency: nominal_hz,
                trend: 0.0,
            })),
            nominal_hz,
            zone: GridZone::Western,
            substation: "SIM 400kV".to_string(),
        }
    }

    /// Force an immediate frequency excursion (test hook)
    pub async fn inject_event(&self, delta_hz: f64) {
        let mut st = self.state.lock().await;
        st.trend = delta_hz;
    }
}

#[async_trait]
impl PmuSource for SimulatedPmu {
    async fn sample(&self) -> Option<PmuSample> {
        let mut st = self.state.lock().await;
        let mut rng = rand::thread_rng();

        // Random walk with mean reversion and the occasional +-200 mHz event
        let noise = Normal::new(0.0, 0.01).ok()?.sample(&mut rng);
        let mean_reversion = (self.nominal_hz - st.frequency) * 0.05;

        if rng.gen_bool(0.01) {
            let magnitude = if rng.gen_bool(0.5) { -0.2 } else { 0.2 };
            st.trend = magnitude;
            warn!(magnitude, "simulated grid frequency event");
        }
        st.trend *= 0.9;

        let delta = noise + mean_reversion + st.trend * 0.1;
        st.frequency = (st.frequency + delta).clamp(self.nominal_hz - 1.0, self.nominal_hz + 1.0);

        Some(PmuSample {
            ts: Utc::now(),
            f_hz: st.frequency,
            rocof_hz_per_s: delta * 10.0,
            sync_locked: true,
            data_valid: true,
            zone: self.zone,
            substation: self.substation.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_pmu_stays_within_band() {
        let pmu = SimulatedPmu::new(50.0);
        for _ in 0..100 {
            let sample = pmu.sample().await.unwrap();
            assert!(sample.f_hz >= 49.0 && sample.f_hz <= 51.0);
            assert!(sample.sync_locked);
            assert!(sample.data_valid);
        }
    }

    #[tokio::test]
    async fn injected_event_moves_frequency() {
        let pmu = SimulatedPmu::new(50.0);
        pmu.inject_event(-0.5).await;
        // The trend decays in over several samples; the first reflects it
        let sample = pmu.sample().await.unwrap();
        assert!(sample.f_hz < 50.05);
    }

    #[test]
    fn sample_round_trips_through_json() {
        let sample = PmuSample {
            ts: Utc::now(),
            f_hz: 49.87,
            rocof_hz_per_s: -0.02,
            sync_locked: true,
            data_valid: true,
            zone: GridZone::Western,
            substation: "Andheri 400kV".to_string(),
        };
        let json = serde_json::to_string(&sample).unwrap();
        let back: PmuSample = serde_json::from_str(&json).unwrap();
        assert_eq!(sample, back);
    }
}
