//! RealtimeHub - Engine Event Distribution
//!
//! ## Responsibilities
//!
//! - Fan-out of camera state, printer telemetry, and alert events to
//!   long-lived subscribers
//! - Bounded buffering: the channel has a fixed capacity and lagging
//!   subscribers lose the oldest messages, never stall publishers

use crate::models::{Alert, CameraState};
use crate::printer_client::PrinterState;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    CameraState(CameraStateMessage),
    PrinterState(PrinterStateMessage),
    Alert(AlertMessage),
    AlertResolved(AlertResolvedMessage),
}

/// Per-iteration camera state update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStateMessage {
    pub camera_id: String,
    pub running: bool,
    pub start_time: Option<String>,
    pub last_result: Option<String>,
    pub last_time: Option<String>,
    pub total_detections: usize,
    /// Observed classification rate over the stored history
    pub frame_rate: f64,
    pub error: Option<String>,
}

impl CameraStateMessage {
    /// Build from a state copy, deriving totals and frame rate
    pub fn from_state(camera_id: &str, state: &CameraState) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            running: state.running,
            start_time: state.start_time.map(|t| t.to_rfc3339()),
            last_result: state.last_result.clone(),
            last_time: state.last_time.map(|t| t.to_rfc3339()),
            total_detections: state.detection_history.len(),
            frame_rate: frame_rate(state),
            error: state.error.clone(),
        }
    }
}

/// Detections per second across the retained history
fn frame_rate(state: &CameraState) -> f64 {
    let history = &state.detection_history;
    if history.len() < 2 {
        return 0.0;
    }
    let first = history.front().map(|s| s.timestamp);
    let last = history.back().map(|s| s.timestamp);
    match (first, last) {
        (Some(first), Some(last)) => {
            let duration = (last - first).num_milliseconds() as f64 / 1000.0;
            if duration > 0.0 {
                (history.len() - 1) as f64 / duration
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// Printer telemetry update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterStateMessage {
    pub camera_id: String,
    pub printer_id: String,
    pub state: PrinterState,
    pub timestamp: String,
}

/// New alert notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub alert_id: String,
    pub camera_id: String,
    pub title: String,
    pub message: String,
    pub countdown_time: u64,
    pub timestamp: String,
    /// Base64 JPEG snapshot
    pub snapshot: String,
}

impl AlertMessage {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id.clone(),
            camera_id: alert.camera_id.clone(),
            title: alert.title.clone(),
            message: alert.message.clone(),
            countdown_time: alert.countdown_time,
            timestamp: alert.timestamp.to_rfc3339(),
            snapshot: base64::engine::general_purpose::STANDARD.encode(&alert.snapshot),
        }
    }
}

/// Alert left the registry (dismissed, cancelled, or cooldown-resolved)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertResolvedMessage {
    pub alert_id: String,
    pub camera_id: String,
    pub timestamp: String,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    tx: broadcast::Sender<HubMessage>,
}

impl RealtimeHub {
    /// Create a hub with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to the event stream.
    ///
    /// A subscriber that falls more than the channel capacity behind
    /// observes a `Lagged` error and resumes from the oldest retained
    /// message; publishers are never blocked.
    pub fn subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }

    /// Publish a message to all subscribers
    pub fn publish(&self, message: HubMessage) {
        let msg_type = match &message {
            HubMessage::CameraState(_) => "camera_state",
            HubMessage::PrinterState(_) => "printer_state",
            HubMessage::Alert(_) => "alert",
            HubMessage::AlertResolved(_) => "alert_resolved",
        };
        match self.tx.send(message) {
            Ok(subscribers) => {
                tracing::trace!(message_type = %msg_type, subscribers, "Hub message published");
            }
            Err(_) => {
                // No subscribers; monitoring continues regardless
                tracing::trace!(message_type = %msg_type, "Hub message dropped (no subscribers)");
            }
        }
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectionSample;
    use chrono::{Duration, Utc};

    fn state_message(camera_id: &str) -> HubMessage {
        HubMessage::CameraState(CameraStateMessage {
            camera_id: camera_id.to_string(),
            running: true,
            start_time: None,
            last_result: None,
            last_time: None,
            total_detections: 0,
            frame_rate: 0.0,
            error: None,
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = RealtimeHub::new(8);
        let mut rx = hub.subscribe();
        hub.publish(state_message("cam-1"));

        let msg = rx.recv().await.unwrap();
        match msg {
            HubMessage::CameraState(m) => assert_eq!(m.camera_id, "cam-1"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let hub = RealtimeHub::new(2);
        for _ in 0..100 {
            hub.publish(state_message("cam-1"));
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let hub = RealtimeHub::new(2);
        let mut rx = hub.subscribe();
        for i in 0..5 {
            hub.publish(state_message(&format!("cam-{i}")));
        }

        // the first recv reports the lag, then delivery resumes from the
        // oldest retained message
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            HubMessage::CameraState(m) => assert_eq!(m.camera_id, "cam-3"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_frame_rate_from_history() {
        let mut state = crate::models::CameraState::default();
        let t0 = Utc::now();
        for i in 0..5 {
            state.detection_history.push_back(DetectionSample {
                timestamp: t0 + Duration::seconds(i),
                label: "success".into(),
            });
        }
        // 4 intervals over 4 seconds
        let msg = CameraStateMessage::from_state("cam-1", &state);
        assert!((msg.frame_rate - 1.0).abs() < 0.01);
    }
}
