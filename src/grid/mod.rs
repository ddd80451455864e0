#![allow(dead_code)]
//! Grid tier: frequency monitor + droop controller
//!
//! Task graph per §control flow: the PMU subscriber feeds samples into the
//! monitor, the control task turns them into power commands, and the
//! dispatcher publishes to the campus (or directly to nodes on the
//! emergency path).

pub mod dispatcher;
pub mod droop;
pub mod monitor;
pub mod pmu;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::campus::client::UpstreamClient;
use crate::config::{Config, FrequencyConfig};
use dispatcher::GridDispatcher;
use droop::{ComplianceChecker, DroopController, DroopSettings};
use monitor::FrequencyMonitor;
use pmu::{PmuSample, PmuSource, SimulatedPmu};

/// Axum state for the grid role
#[derive(Clone)]
pub struct GridState {
    pub monitor: Arc<Mutex<FrequencyMonitor>>,
    pub droop: Arc<Mutex<DroopController>>,
    pub dispatcher: Arc<GridDispatcher>,
    pub pmu: Arc<dyn PmuSource>,
    /// Last sample and its arrival instant, for gap detection
    pub last_sample: Arc<RwLock<Option<(PmuSample, Instant)>>>,
    /// Cached campus state used for adaptive derating
    pub battery_state: Arc<RwLock<(Option<f64>, Option<f64>)>>,
    pub campus: Option<Arc<UpstreamClient>>,
    /// Monitor thresholds, kept for coherence checks on settings updates
    pub frequency: FrequencyConfig,
}

impl GridState {
    pub fn new(cfg: &Config) -> Result<Self> {
        let settings = DroopSettings::from_config(&cfg.droop)?;
        let mut controller = DroopController::new(settings);
        if controller.settings().mode != droop::ResponseMode::Off {
            controller.enable();
        }

        let campus = cfg
            .droop
            .campus_url
            .as_ref()
            .map(|url| UpstreamClient::new(url, Duration::from_secs(5)).map(Arc::new))
            .transpose()?;

        Ok(Self {
            monitor: Arc::new(Mutex::new(FrequencyMonitor::new(cfg.frequency.clone()))),
            droop: Arc::new(Mutex::new(controller)),
            dispatcher: Arc::new(GridDispatcher::new(&cfg.droop)?),
            pmu: Arc::new(SimulatedPmu::new(cfg.droop.f_nominal_hz)),
            last_sample: Arc::new(RwLock::new(None)),
            battery_state: Arc::new(RwLock::new((None, None))),
            campus,
            frequency: cfg.frequency.clone(),
        })
    }
}

pub fn spawn_grid_tasks(state: GridState, cfg: &Config) {
    let sample_interval = Duration::from_millis(cfg.pmu.sample_interval_ms.max(10));
    let hold_budget = Duration::from_millis(cfg.pmu.hold_ms);

    // PMU subscriber + control task: consume samples, classify, command
    let control = state.clone();
    let mut compliance = ComplianceChecker::new();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sample_interval);
        loop {
            interval.tick().await;
            let now = Utc::now();

            let sample = control.pmu.sample().await;
            if let Some(sample) = &sample {
                *control.last_sample.write().await = Some((sample.clone(), Instant::now()));
            }

            // Gap fill: hold the last sample for at most the budget, then
            // the stream is invalid and the command goes to zero
            let held = control.last_sample.read().await.clone();
            let Some((current, received)) = held else {
                continue;
            };
            let stream_valid = received.elapsed() <= hold_budget;
            if !stream_valid {
                debug!("PMU stream stale beyond hold budget");
            }

            let band = {
                let mut monitor = control.monitor.lock().await;
                if sample.is_some() && stream_valid {
                    monitor.update(&current);
                }
                monitor.band()
            };
            compliance.on_band(band, now);

            // Emergency path: critical bands bypass the campus entirely
            if stream_valid && band.is_critical() {
                control.dispatcher.emergency_fanout(band, now).await;
                compliance.on_command(
                    control
                        .droop
                        .lock()
                        .await
                        .emergency_command(band)
                        .unwrap_or(0.0),
                    now,
                );
                continue;
            }
            if control.dispatcher.in_emergency_hold(now).await {
                continue;
            }

            let (soc, temperature) = *control.battery_state.read().await;
            let command = control
                .droop
                .lock()
                .await
                .compute(&current, stream_valid, soc, temperature);
            compliance.on_command(command, now);

            control.dispatcher.publish_response(command, now).await;
        }
    });

    // Campus state poller: refresh SOC/temperature for adaptive derating
    if let Some(campus) = state.campus.clone() {
        let battery_state = Arc::clone(&state.battery_state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                match campus.campus_telemetry().await {
                    Ok(rollup) => {
                        *battery_state.write().await =
                            (Some(rollup.average_soc), rollup.average_temperature);
                    }
                    Err(e) => {
                        warn!(error = %e, "campus rollup fetch failed, keeping last derating inputs");
                    }
                }
            }
        });
    }
}
