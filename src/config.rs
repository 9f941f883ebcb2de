//! Engine configuration
//!
//! Environment-driven settings with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path of the camera-state snapshot file
    pub state_path: PathBuf,
    /// Directory for cached exemplar sets
    pub exemplar_cache_dir: PathBuf,
    /// In-memory detection history cap per camera
    pub history_cap: usize,
    /// Persist camera states every Nth history append
    pub persist_every: usize,
    /// Realtime hub channel capacity
    pub hub_capacity: usize,
    /// Grace period before a stopping detection loop is force-cancelled
    pub stop_grace: Duration,
    /// Printer telemetry polling interval
    pub printer_poll_interval: Duration,
    /// Class label representing a healthy print
    pub success_label: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_path: std::env::var("PRINTWATCH_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/printwatch/camera_states.json")),
            exemplar_cache_dir: std::env::var("PRINTWATCH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/printwatch/exemplars")),
            history_cap: 10_000,
            persist_every: 100,
            hub_capacity: 256,
            stop_grace: Duration::from_secs(3),
            printer_poll_interval: std::env::var("PRINTWATCH_PRINTER_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(2000)),
            success_label: std::env::var("PRINTWATCH_SUCCESS_LABEL")
                .unwrap_or_else(|_| "success".to_string()),
        }
    }
}
