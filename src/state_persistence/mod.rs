//! Camera-state persistence
//!
//! ## Responsibilities
//!
//! - Best-effort snapshot of camera states to disk
//! - Startup load with per-entry fault tolerance
//!
//! Persistence never blocks the hot path: the store spawns snapshot
//! writes and logs failures, and the in-memory copy stays authoritative
//! for the lifetime of the process.

use crate::error::{Error, Result};
use crate::models::CameraState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// Number of trailing history samples kept in persisted snapshots
const PERSISTED_HISTORY_LIMIT: usize = 1000;

/// Persistence seam for camera states
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Load all persisted states. Missing storage yields an empty map.
    async fn load_states(&self) -> Result<HashMap<String, CameraState>>;
    /// Save a full snapshot of all states.
    async fn save_states(&self, states: &HashMap<String, CameraState>) -> Result<()>;
}

/// JSON file persistence with atomic tmp + rename writes
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl StatePersistence for JsonFilePersistence {
    async fn load_states(&self) -> Result<HashMap<String, CameraState>> {
        let raw = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No persisted camera states");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let entries: HashMap<String, serde_json::Value> = serde_json::from_slice(&raw)?;
        let mut states = HashMap::with_capacity(entries.len());
        for (camera_id, value) in entries {
            match serde_json::from_value::<CameraState>(value) {
                Ok(state) => {
                    states.insert(camera_id, state);
                }
                Err(e) => {
                    // A single corrupt entry must not take down the rest
                    tracing::warn!(
                        camera_id = %camera_id,
                        error = %e,
                        "Failed to load camera state, using defaults"
                    );
                    states.insert(camera_id, CameraState::default());
                }
            }
        }
        Ok(states)
    }

    async fn save_states(&self, states: &HashMap<String, CameraState>) -> Result<()> {
        let mut trimmed: HashMap<&String, CameraState> = HashMap::with_capacity(states.len());
        for (camera_id, state) in states {
            let mut state = state.clone();
            let len = state.detection_history.len();
            if len > PERSISTED_HISTORY_LIMIT {
                state.detection_history.drain(..len - PERSISTED_HISTORY_LIMIT);
            }
            trimmed.insert(camera_id, state);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(&trimmed)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Persistence(format!("rename snapshot: {e}")))?;

        tracing::debug!(
            path = %self.path.display(),
            cameras = states.len(),
            "Camera states persisted"
        );
        Ok(())
    }
}
