//! Shared data types
//!
//! Camera runtime state, alerts, frames, and printer configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default detection history cap (in-memory)
pub const MAX_DETECTION_HISTORY: usize = 10_000;

/// Action applied when an alert cooldown expires (or on manual resolution)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Dismiss,
    CancelPrint,
    PausePrint,
}

impl Default for AlertAction {
    fn default() -> Self {
        Self::Dismiss
    }
}

/// Occupancy of a camera's single alert slot.
///
/// `Claimed` is the transient marker set by the atomic claim before the
/// alert object exists; `Active` carries the registered alert id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertSlot {
    Claimed,
    Active(String),
}

/// One classified frame in a camera's detection history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSample {
    pub timestamp: DateTime<Utc>,
    pub label: String,
}

/// Decoded video frame (tightly packed RGB8)
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Printer binding for a camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    /// Printer service kind; only "octoprint" is currently supported
    pub printer_type: String,
}

/// Per-camera runtime state.
///
/// Owned by the CameraStateStore and mutated only through its API. Task
/// handles never live here; they are kept in the owning service registries
/// so the state stays serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraState {
    pub nickname: Option<String>,
    // Tunables
    pub brightness: f64,
    pub contrast: f64,
    pub focus: f64,
    pub sensitivity: f64,
    /// Alert cooldown duration in seconds
    pub countdown_time: u64,
    pub countdown_action: AlertAction,
    pub majority_vote_window: usize,
    pub majority_vote_threshold: usize,
    // Runtime
    #[serde(skip)]
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub detection_history: VecDeque<DetectionSample>,
    /// Monotone count of history appends; drives the persistence cadence
    /// even after the history is pinned at its cap
    #[serde(skip)]
    pub append_seq: u64,
    /// Alert slot; not persisted since the alert registry is process-local
    #[serde(skip)]
    pub alert_slot: Option<AlertSlot>,
    // Printer binding
    pub printer_id: Option<String>,
    pub printer_config: Option<PrinterConfig>,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            nickname: None,
            brightness: 1.0,
            contrast: 1.0,
            focus: 1.0,
            sensitivity: 1.0,
            countdown_time: 60,
            countdown_action: AlertAction::default(),
            majority_vote_window: 8,
            majority_vote_threshold: 4,
            running: false,
            start_time: None,
            last_result: None,
            last_time: None,
            error: None,
            detection_history: VecDeque::new(),
            append_seq: 0,
            alert_slot: None,
            printer_id: None,
            printer_config: None,
        }
    }
}

impl CameraState {
    /// Id of the currently active alert, if an alert object exists
    pub fn current_alert_id(&self) -> Option<&str> {
        match &self.alert_slot {
            Some(AlertSlot::Active(id)) => Some(id),
            _ => None,
        }
    }
}

/// Explicit partial update for a CameraState.
///
/// Every mutable field is an `Option`; unset fields are left untouched.
/// Option-valued state fields use a nested `Option` so callers can clear
/// them. Unknown field names are unrepresentable by construction.
#[derive(Debug, Clone, Default)]
pub struct CameraUpdate {
    pub nickname: Option<Option<String>>,
    pub brightness: Option<f64>,
    pub contrast: Option<f64>,
    pub focus: Option<f64>,
    pub sensitivity: Option<f64>,
    pub countdown_time: Option<u64>,
    pub countdown_action: Option<AlertAction>,
    pub majority_vote_window: Option<usize>,
    pub majority_vote_threshold: Option<usize>,
    pub running: Option<bool>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub last_result: Option<Option<String>>,
    pub last_time: Option<Option<DateTime<Utc>>>,
    pub error: Option<Option<String>>,
    pub printer_id: Option<Option<String>>,
    pub printer_config: Option<Option<PrinterConfig>>,
}

impl CameraUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nickname(mut self, v: Option<String>) -> Self {
        self.nickname = Some(v);
        self
    }

    pub fn brightness(mut self, v: f64) -> Self {
        self.brightness = Some(v);
        self
    }

    pub fn contrast(mut self, v: f64) -> Self {
        self.contrast = Some(v);
        self
    }

    pub fn focus(mut self, v: f64) -> Self {
        self.focus = Some(v);
        self
    }

    pub fn sensitivity(mut self, v: f64) -> Self {
        self.sensitivity = Some(v);
        self
    }

    pub fn countdown_time(mut self, secs: u64) -> Self {
        self.countdown_time = Some(secs);
        self
    }

    pub fn countdown_action(mut self, v: AlertAction) -> Self {
        self.countdown_action = Some(v);
        self
    }

    pub fn majority_vote_window(mut self, v: usize) -> Self {
        self.majority_vote_window = Some(v);
        self
    }

    pub fn majority_vote_threshold(mut self, v: usize) -> Self {
        self.majority_vote_threshold = Some(v);
        self
    }

    pub fn running(mut self, v: bool) -> Self {
        self.running = Some(v);
        self
    }

    pub fn start_time(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.start_time = Some(v);
        self
    }

    pub fn last_result(mut self, v: Option<String>) -> Self {
        self.last_result = Some(v);
        self
    }

    pub fn last_time(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.last_time = Some(v);
        self
    }

    pub fn error(mut self, v: Option<String>) -> Self {
        self.error = Some(v);
        self
    }

    pub fn printer_id(mut self, v: Option<String>) -> Self {
        self.printer_id = Some(v);
        self
    }

    pub fn printer_config(mut self, v: Option<PrinterConfig>) -> Self {
        self.printer_config = Some(v);
        self
    }

    /// Apply set fields onto a state
    pub fn apply(&self, state: &mut CameraState) {
        if let Some(v) = &self.nickname {
            state.nickname = v.clone();
        }
        if let Some(v) = self.brightness {
            state.brightness = v;
        }
        if let Some(v) = self.contrast {
            state.contrast = v;
        }
        if let Some(v) = self.focus {
            state.focus = v;
        }
        if let Some(v) = self.sensitivity {
            state.sensitivity = v;
        }
        if let Some(v) = self.countdown_time {
            state.countdown_time = v;
        }
        if let Some(v) = self.countdown_action {
            state.countdown_action = v;
        }
        if let Some(v) = self.majority_vote_window {
            state.majority_vote_window = v;
        }
        if let Some(v) = self.majority_vote_threshold {
            state.majority_vote_threshold = v;
        }
        if let Some(v) = self.running {
            state.running = v;
        }
        if let Some(v) = &self.start_time {
            state.start_time = *v;
        }
        if let Some(v) = &self.last_result {
            state.last_result = v.clone();
        }
        if let Some(v) = &self.last_time {
            state.last_time = *v;
        }
        if let Some(v) = &self.error {
            state.error = v.clone();
        }
        if let Some(v) = &self.printer_id {
            state.printer_id = v.clone();
        }
        if let Some(v) = &self.printer_config {
            state.printer_config = v.clone();
        }
    }
}

/// A raised defect alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    /// JPEG-encoded snapshot of the triggering frame
    #[serde(skip_serializing)]
    pub snapshot: Vec<u8>,
    pub title: String,
    pub message: String,
    /// Cooldown duration in seconds
    pub countdown_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_applies_only_set_fields() {
        let mut state = CameraState::default();
        let update = CameraUpdate::new().brightness(1.4).error(Some("boom".into()));
        update.apply(&mut state);
        assert_eq!(state.brightness, 1.4);
        assert_eq!(state.error.as_deref(), Some("boom"));
        // untouched
        assert_eq!(state.contrast, 1.0);
        assert_eq!(state.countdown_time, 60);
    }

    #[test]
    fn test_update_clears_optional_field() {
        let mut state = CameraState::default();
        state.error = Some("stale".into());
        CameraUpdate::new().error(None).apply(&mut state);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_state_roundtrip_skips_runtime_fields() {
        let mut state = CameraState::default();
        state.running = true;
        state.alert_slot = Some(AlertSlot::Claimed);
        state.sensitivity = 1.2;
        let json = serde_json::to_string(&state).unwrap();
        let loaded: CameraState = serde_json::from_str(&json).unwrap();
        assert!(!loaded.running);
        assert!(loaded.alert_slot.is_none());
        assert_eq!(loaded.sensitivity, 1.2);
    }
}
