#![allow(dead_code)]
//! Publishes droop responses downward
//!
//! Normal path: the computed response goes to the campus aggregator as a
//! single dispatch. Emergency path: when the grid crosses a critical band,
//! the campus is bypassed and every online node is commanded directly at
//! rated magnitude, subject only to its local safety manager. The emergency
//! path has a minimum hold time to avoid chatter at the band edge.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::campus::client::{CampusDispatchRequest, NodeClient, UpstreamClient};
use crate::config::DroopConfig;
use crate::domain::{NodeStatus, Setpoint};
use crate::grid::monitor::FrequencyBand;

const FANOUT_CONCURRENCY: usize = 16;

pub struct GridDispatcher {
    campus: Option<UpstreamClient>,
    source_id: String,
    seq: AtomicU64,
    emergency_hold: ChronoDuration,
    emergency_until: Mutex<Option<DateTime<Utc>>>,
    /// Last value actually published to the campus, to suppress no-op calls
    last_published_kw: Mutex<Option<f64>>,
}

impl GridDispatcher {
    pub fn new(cfg: &DroopConfig) -> Result<Self> {
        let campus = cfg
            .campus_url
            .as_ref()
            .map(|url| UpstreamClient::new(url, Duration::from_secs(5)))
            .transpose()?;
        Ok(Self {
            campus,
            source_id: "fdc".to_string(),
            seq: AtomicU64::new(1),
            emergency_hold: ChronoDuration::seconds(cfg.emergency_hold_secs as i64),
            emergency_until: Mutex::new(None),
            last_published_kw: Mutex::new(None),
        })
    }

    /// True while a previous emergency fan-out must be held
    pub async fn in_emergency_hold(&self, now: DateTime<Utc>) -> bool {
        self.emergency_until
            .lock()
            .await
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Publish a droop response (positive = discharge) to the campus
    ///
    /// The campus wire convention is positive = charge, so the sign flips
    /// at this boundary.
    pub async fn publish_response(&self, response_kw: f64, now: DateTime<Utc>) {
        if self.in_emergency_hold(now).await {
            return;
        }
        let Some(campus) = &self.campus else {
            return;
        };

        {
            let last = self.last_published_kw.lock().await;
            if let Some(last_kw) = *last {
                if (last_kw - response_kw).abs() < 0.1 {
                    return;
                }
            }
        }

        let request = CampusDispatchRequest {
            total_kw: -response_kw,
            strategy: "proportional".to_string(),
            node_setpoints: None,
            reason: Some("frequency droop response".to_string()),
        };
        match campus.dispatch(&request).await {
            Ok(()) => {
                *self.last_published_kw.lock().await = Some(response_kw);
            }
            Err(e) => warn!(error = %e, "failed to publish droop response to campus"),
        }
    }

    /// Bypass the campus and command every online node at rated magnitude
    ///
    /// `response_kw` is the FDC-sign emergency command (positive =
    /// discharge); each node receives its own rated power with the matching
    /// wire sign. Nodes' safety managers remain the final authority.
    pub async fn emergency_fanout(&self, band: FrequencyBand, now: DateTime<Utc>) {
        let Some(campus) = &self.campus else {
            warn!("emergency band but no campus configured, nothing to command");
            return;
        };

        let discharge = band == FrequencyBand::CriticalLow;
        {
            let mut until = self.emergency_until.lock().await;
            *until = Some(now + self.emergency_hold);
        }

        let nodes = match campus.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "emergency fan-out: node listing failed");
                return;
            }
        };

        let valid_until = now + self.emergency_hold + ChronoDuration::seconds(5);
        let targets: Vec<(String, f64, String)> = nodes
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online)
            .map(|n| {
                // Wire sign: positive = charge, so discharge is negative
                let target_kw = if discharge {
                    -n.identity.rated_power_kw
                } else {
                    n.identity.rated_power_kw
                };
                (n.identity.node_id, target_kw, n.endpoint)
            })
            .collect();

        if targets.is_empty() {
            warn!("emergency fan-out: no online nodes");
            return;
        }

        error!(
            band = %band,
            nodes = targets.len(),
            "EMERGENCY frequency response: bypassing campus, commanding nodes directly"
        );

        let results = stream::iter(targets)
            .map(|(node_id, target_kw, endpoint)| {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                let source_id = self.source_id.clone();
                async move {
                    let setpoint = Setpoint {
                        target_kw,
                        target_kvar: 0.0,
                        valid_until,
                        reason: format!("emergency frequency response ({band})"),
                        source_id,
                        seq,
                    };
                    let result = match NodeClient::new(&endpoint, Duration::from_secs(2)) {
                        Ok(client) => client.send_setpoint(&setpoint).await,
                        Err(e) => Err(e),
                    };
                    (node_id, target_kw, result)
                }
            })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        for (node_id, target_kw, result) in results {
            match result {
                Ok(()) => info!(node_id = %node_id, target_kw, "emergency setpoint delivered"),
                Err(e) => error!(node_id = %node_id, error = %e, "emergency setpoint failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> GridDispatcher {
        GridDispatcher::new(&DroopConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn hold_window_tracks_time() {
        let d = dispatcher();
        let now = Utc::now();
        assert!(!d.in_emergency_hold(now).await);

        *d.emergency_until.lock().await = Some(now + ChronoDuration::seconds(5));
        assert!(d.in_emergency_hold(now).await);
        assert!(!d.in_emergency_hold(now + ChronoDuration::seconds(6)).await);
    }

    #[tokio::test]
    async fn publish_without_campus_is_a_noop() {
        let d = dispatcher();
        // No campus configured; must not panic or hang
        d.publish_response(25.0, Utc::now()).await;
    }
}
