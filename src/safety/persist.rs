//! Persistence for the safety latch across restarts
//!
//! Only two items survive a restart: the emergency-stop latch and the last
//! reduction factor. Everything else is rebuilt from telemetry. The file is
//! written atomically (temp + rename) so a crash mid-write cannot leave a
//! half-written state that would allow an unsafe cold start.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use super::manager::RuntimeState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PersistedSafetyState {
    pub emergency_stopped: bool,
    pub power_reduction_factor: f64,
}

impl From<RuntimeState> for PersistedSafetyState {
    fn from(runtime: RuntimeState) -> Self {
        Self {
            emergency_stopped: runtime.emergency_stopped,
            power_reduction_factor: runtime.power_reduction_factor,
        }
    }
}

impl From<PersistedSafetyState> for RuntimeState {
    fn from(persisted: PersistedSafetyState) -> Self {
        Self {
            emergency_stopped: persisted.emergency_stopped,
            power_reduction_factor: persisted.power_reduction_factor.clamp(0.0, 1.0),
        }
    }
}

/// Load the persisted state, or None on first boot
///
/// An unreadable file is treated as absent with a warning; refusing to boot
/// over a corrupt latch file would keep a healthy battery offline, while the
/// conservative default (no latch, full reduction applied on first
/// violations) is restored within one tick.
pub async fn load(path: &Path) -> Option<RuntimeState> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<PersistedSafetyState>(&bytes) {
            Ok(state) => Some(state.into()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt safety state file");
                None
            }
        },
        Err(_) => None,
    }
}

/// Write the state atomically
pub async fn store(path: &Path, runtime: RuntimeState) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let persisted = PersistedSafetyState::from(runtime);
    let bytes = serde_json::to_vec_pretty(&persisted)?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety_state.json");

        let state = RuntimeState {
            emergency_stopped: true,
            power_reduction_factor: 0.5,
        };
        store(&path, state).await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert!(loaded.emergency_stopped);
        assert_eq!(loaded.power_reduction_factor, 0.5);
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.json")).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety_state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(load(&path).await.is_none());
    }

    #[tokio::test]
    async fn factor_clamped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety_state.json");
        tokio::fs::write(
            &path,
            br#"{"emergency_stopped":false,"power_reduction_factor":3.5}"#,
        )
        .await
        .unwrap();
        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.power_reduction_factor, 1.0);
    }
}
