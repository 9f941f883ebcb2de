//! AlertService - Alert Lifecycle
//!
//! ## Responsibilities
//!
//! - Alert registry (one live alert per camera, enforced by the store's
//!   alert-slot claim)
//! - Cooldown tasks applying the camera's default action when no human
//!   resolves the alert in time
//! - Manual dismiss / cancel-print / pause-print resolution
//!
//! Resolution always wins over external side effects: a printer call may
//! fail and be swallowed, but the alert itself is dismissed regardless.

use crate::camera_state_store::CameraStateStore;
use crate::error::{Error, Result};
use crate::models::{Alert, AlertAction, Frame};
use crate::notification_service::Notifier;
use crate::printer_client::PrinterConnector;
use crate::realtime_hub::{AlertMessage, AlertResolvedMessage, HubMessage, RealtimeHub};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// AlertService instance
pub struct AlertService {
    store: Arc<CameraStateStore>,
    hub: Arc<RealtimeHub>,
    notifier: Arc<dyn Notifier>,
    connector: Arc<dyn PrinterConnector>,
    /// Live alerts keyed by alert id
    alerts: RwLock<HashMap<String, Alert>>,
    /// Cooldown tasks keyed by alert id
    cooldowns: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AlertService {
    /// Create a new AlertService
    pub fn new(
        store: Arc<CameraStateStore>,
        hub: Arc<RealtimeHub>,
        notifier: Arc<dyn Notifier>,
        connector: Arc<dyn PrinterConnector>,
    ) -> Self {
        Self {
            store,
            hub,
            notifier,
            connector,
            alerts: RwLock::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Create an alert for a camera whose slot was just claimed.
    ///
    /// Encodes the triggering frame, registers the alert, converts the
    /// claim into the alert id, schedules the cooldown, and dispatches the
    /// notification fire-and-forget. On encoding failure the claim is
    /// rolled back so the camera can alert again.
    pub async fn create(
        self: &Arc<Self>,
        camera_id: &str,
        frame: &Frame,
        timestamp: DateTime<Utc>,
    ) -> Result<Alert> {
        let state = self.store.get(camera_id, false).await;
        let display_name = state.nickname.clone().unwrap_or_else(|| camera_id.to_string());

        let snapshot = match encode_snapshot(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.store.release_claim(camera_id).await;
                return Err(e);
            }
        };

        let alert = Alert {
            id: format!("{camera_id}_{}", Uuid::new_v4()),
            camera_id: camera_id.to_string(),
            timestamp,
            snapshot,
            title: format!("Defect - Camera {display_name}"),
            message: format!("Defect detected on camera {display_name}"),
            countdown_time: state.countdown_time,
        };

        self.alerts
            .write()
            .await
            .insert(alert.id.clone(), alert.clone());
        self.store.set_active_alert(camera_id, &alert.id).await?;

        self.spawn_cooldown(&alert).await;

        let notifier = self.notifier.clone();
        let notify_alert = alert.clone();
        tokio::spawn(async move {
            if !notifier.send(&notify_alert).await {
                tracing::warn!(alert_id = %notify_alert.id, "Alert notification not fully delivered");
            }
        });

        self.hub
            .publish(HubMessage::Alert(AlertMessage::from_alert(&alert)));

        tracing::info!(
            alert_id = %alert.id,
            camera_id = %camera_id,
            countdown_time = alert.countdown_time,
            "Alert created"
        );
        Ok(alert)
    }

    /// Schedule the cooldown for an alert
    async fn spawn_cooldown(self: &Arc<Self>, alert: &Alert) {
        let service = self.clone();
        let alert_id = alert.id.clone();
        let camera_id = alert.camera_id.clone();
        let countdown = Duration::from_secs(alert.countdown_time);

        // Registration is completed under the registry lock before the
        // task can reach its self-removal, so even a zero countdown never
        // leaves a finished handle behind
        let mut cooldowns = self.cooldowns.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(countdown).await;

            // Drop our own handle first so the resolution path below never
            // aborts the task that is executing it
            service.cooldowns.lock().await.remove(&alert_id);

            if !service.alerts.read().await.contains_key(&alert_id) {
                return;
            }

            let action = service.store.get(&camera_id, false).await.countdown_action;
            tracing::info!(
                alert_id = %alert_id,
                camera_id = %camera_id,
                action = ?action,
                "Alert cooldown expired, applying default action"
            );
            match action {
                AlertAction::Dismiss => {
                    service.dismiss(&alert_id).await;
                }
                AlertAction::CancelPrint => {
                    service.cancel_print(&alert_id).await;
                }
                AlertAction::PausePrint => {
                    service.pause_print(&alert_id).await;
                }
            }
        });

        cooldowns.insert(alert.id.clone(), handle);
    }

    /// Dismiss an alert; returns whether it was present. Idempotent.
    pub async fn dismiss(&self, alert_id: &str) -> bool {
        let removed = self.alerts.write().await.remove(alert_id);
        let Some(alert) = removed else {
            return false;
        };

        if let Some(handle) = self.cooldowns.lock().await.remove(alert_id) {
            handle.abort();
        }

        self.store.clear_alert(&alert.camera_id).await;
        self.hub
            .publish(HubMessage::AlertResolved(AlertResolvedMessage {
                alert_id: alert.id.clone(),
                camera_id: alert.camera_id.clone(),
                timestamp: Utc::now().to_rfc3339(),
            }));

        tracing::info!(alert_id = %alert_id, camera_id = %alert.camera_id, "Alert dismissed");
        true
    }

    /// Cancel the bound printer's job (if any), then dismiss
    pub async fn cancel_print(&self, alert_id: &str) -> bool {
        self.resolve_with_printer(alert_id, AlertAction::CancelPrint)
            .await
    }

    /// Pause the bound printer's job (if any), then dismiss
    pub async fn pause_print(&self, alert_id: &str) -> bool {
        self.resolve_with_printer(alert_id, AlertAction::PausePrint)
            .await
    }

    async fn resolve_with_printer(&self, alert_id: &str, action: AlertAction) -> bool {
        let camera_id = match self.alerts.read().await.get(alert_id) {
            Some(alert) => alert.camera_id.clone(),
            None => return false,
        };

        // Printer failures are logged and swallowed: resolving the alert
        // takes priority over confirming the external side effect
        if let Err(e) = self.suspend_print_job(&camera_id, action).await {
            tracing::error!(
                camera_id = %camera_id,
                action = ?action,
                error = %e,
                "Print suspension failed"
            );
        }

        self.dismiss(alert_id).await
    }

    /// Issue a cancel/pause to the camera's bound printer when a job is
    /// actively printing
    async fn suspend_print_job(&self, camera_id: &str, action: AlertAction) -> Result<()> {
        let state = self.store.get(camera_id, false).await;
        let Some(config) = state.printer_config else {
            tracing::warn!(camera_id = %camera_id, "No printer bound, nothing to suspend");
            return Ok(());
        };

        let client = self.connector.connect(&config)?;
        let job = client.get_job_info().await?;
        if !job.is_printing() {
            tracing::debug!(
                camera_id = %camera_id,
                job_state = %job.state,
                "No active print job, skipping printer command"
            );
            return Ok(());
        }

        match action {
            AlertAction::CancelPrint => {
                client.cancel_job().await?;
                tracing::info!(camera_id = %camera_id, printer = %config.name, "Print cancelled");
            }
            AlertAction::PausePrint => {
                client.pause_job().await?;
                tracing::info!(camera_id = %camera_id, printer = %config.name, "Print paused");
            }
            AlertAction::Dismiss => {}
        }
        Ok(())
    }

    /// Look up a live alert
    pub async fn get(&self, alert_id: &str) -> Option<Alert> {
        self.alerts.read().await.get(alert_id).cloned()
    }

    /// All live alerts
    pub async fn list(&self) -> Vec<Alert> {
        self.alerts.read().await.values().cloned().collect()
    }

    /// Abort all outstanding cooldown tasks
    pub async fn shutdown(&self) {
        let mut cooldowns = self.cooldowns.lock().await;
        for (alert_id, handle) in cooldowns.drain() {
            tracing::debug!(alert_id = %alert_id, "Aborting cooldown task");
            handle.abort();
        }
    }
}

/// JPEG-encode a frame for alert snapshots
fn encode_snapshot(frame: &Frame) -> Result<Vec<u8>> {
    let img: image::RgbImage =
        image::ImageBuffer::from_raw(frame.width, frame.height, frame.pixels.clone())
            .ok_or_else(|| Error::Camera("frame buffer does not match its dimensions".into()))?;

    let mut bytes = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(std::io::Cursor::new(&mut bytes), 85);
    encoder
        .encode_image(&img)
        .map_err(|e| Error::Internal(format!("snapshot encode: {e}")))?;
    Ok(bytes)
}
