//! PrinterPollService - Printer Telemetry Polling
//!
//! ## Responsibilities
//!
//! - One polling task per camera with a printer binding
//! - Periodic job/temperature snapshots published on the realtime hub
//!
//! Poll failures are logged and the task keeps its cadence; a printer
//! going offline must not kill its telemetry stream.

use crate::camera_state_store::CameraStateStore;
use crate::printer_client::PrinterConnector;
use crate::realtime_hub::{HubMessage, PrinterStateMessage, RealtimeHub};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

struct PollTask {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// PrinterPollService instance
pub struct PrinterPollService {
    store: Arc<CameraStateStore>,
    hub: Arc<RealtimeHub>,
    connector: Arc<dyn PrinterConnector>,
    interval: Duration,
    tasks: Mutex<HashMap<String, PollTask>>,
}

impl PrinterPollService {
    /// Create a new PrinterPollService
    pub fn new(
        store: Arc<CameraStateStore>,
        hub: Arc<RealtimeHub>,
        connector: Arc<dyn PrinterConnector>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            connector,
            interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling a camera's printer; returns whether a task was
    /// started. A camera without a printer binding is a logged no-op,
    /// as is a camera already being polled.
    pub async fn start(self: &Arc<Self>, camera_id: &str) -> bool {
        let state = self.store.get(camera_id, false).await;
        if state.printer_config.is_none() {
            tracing::warn!(camera_id = %camera_id, "No printer bound, polling not started");
            return false;
        }

        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(camera_id) {
            if !task.handle.is_finished() {
                tracing::debug!(camera_id = %camera_id, "Printer polling already running");
                return false;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let service = self.clone();
        let id = camera_id.to_string();
        let handle = tokio::spawn(async move {
            service.poll_loop(&id, stop_rx).await;
        });
        tasks.insert(camera_id.to_string(), PollTask { handle, stop_tx });

        tracing::info!(camera_id = %camera_id, interval = ?self.interval, "Printer polling started");
        true
    }

    async fn poll_loop(self: Arc<Self>, camera_id: &str, mut stop_rx: watch::Receiver<bool>) {
        loop {
            self.poll_once(camera_id).await;
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::debug!(camera_id = %camera_id, "Printer polling loop exited");
    }

    /// One poll: connect, fetch telemetry, publish
    async fn poll_once(&self, camera_id: &str) {
        // re-read the binding each tick so config updates take effect
        let state = self.store.get(camera_id, false).await;
        let Some(config) = state.printer_config else {
            tracing::warn!(camera_id = %camera_id, "Printer binding removed while polling");
            return;
        };

        let client = match self.connector.connect(&config) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(camera_id = %camera_id, error = %e, "Printer connect failed");
                return;
            }
        };

        match client.get_printer_state().await {
            Ok(printer_state) => {
                self.hub
                    .publish(HubMessage::PrinterState(PrinterStateMessage {
                        camera_id: camera_id.to_string(),
                        printer_id: state.printer_id.clone().unwrap_or_else(|| config.name.clone()),
                        state: printer_state,
                        timestamp: Utc::now().to_rfc3339(),
                    }));
            }
            Err(e) => {
                tracing::warn!(camera_id = %camera_id, printer = %config.name, error = %e, "Printer poll failed");
            }
        }
    }

    /// Stop polling a camera; returns whether a task was running
    pub async fn stop(&self, camera_id: &str) -> bool {
        let task = self.tasks.lock().await.remove(camera_id);
        let Some(task) = task else {
            tracing::warn!(camera_id = %camera_id, "Stop requested but printer polling is not running");
            return false;
        };

        let _ = task.stop_tx.send(true);
        if task.handle.await.is_err() {
            tracing::warn!(camera_id = %camera_id, "Printer polling task ended abnormally");
        }
        tracing::info!(camera_id = %camera_id, "Printer polling stopped");
        true
    }

    /// Whether a camera currently has a live polling task
    pub async fn is_polling(&self, camera_id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(camera_id)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop every polling task
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for camera_id in ids {
            self.stop(&camera_id).await;
        }
    }
}
