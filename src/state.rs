//! Engine wiring
//!
//! Builds the service graph and owns shutdown ordering.

use crate::alert_service::AlertService;
use crate::camera_state_store::CameraStateStore;
use crate::config::AppConfig;
use crate::detection_service::DetectionService;
use crate::exemplar_classifier::ExemplarCache;
use crate::frame_source::{FrameEncoder, FrameSource};
use crate::notification_service::{Notifier, WebhookNotifier};
use crate::printer_client::{OctoPrintConnector, PrinterConnector};
use crate::printer_poll_service::PrinterPollService;
use crate::realtime_hub::RealtimeHub;
use crate::state_persistence::JsonFilePersistence;
use std::sync::Arc;

/// Shared engine state: every service, wired once at startup
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<CameraStateStore>,
    pub hub: Arc<RealtimeHub>,
    pub alerts: Arc<AlertService>,
    pub detection: Arc<DetectionService>,
    pub printer_poll: Arc<PrinterPollService>,
    pub exemplar_cache: Arc<ExemplarCache>,
    /// Kept as the concrete type so endpoints can be managed at runtime
    pub notifier: Arc<WebhookNotifier>,
}

impl AppState {
    /// Wire the engine with the default webhook notifier and OctoPrint
    /// connector. `source` and `encoder` stay injectable since capture
    /// devices and embedding models are deployment-specific.
    pub async fn new(
        config: AppConfig,
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn FrameEncoder>,
    ) -> Self {
        let notifier = Arc::new(WebhookNotifier::new());
        Self::with_seams(config, source, encoder, notifier, Arc::new(OctoPrintConnector)).await
    }

    /// Wire the engine with explicit notifier and printer seams
    pub async fn with_seams(
        config: AppConfig,
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn FrameEncoder>,
        notifier: Arc<WebhookNotifier>,
        connector: Arc<dyn PrinterConnector>,
    ) -> Self {
        let persistence = Arc::new(JsonFilePersistence::new(config.state_path.clone()));
        let store = Arc::new(CameraStateStore::new(
            persistence,
            config.history_cap,
            config.persist_every,
        ));
        store.load().await;

        let hub = Arc::new(RealtimeHub::new(config.hub_capacity));
        let alerts = Arc::new(AlertService::new(
            store.clone(),
            hub.clone(),
            notifier.clone() as Arc<dyn Notifier>,
            connector.clone(),
        ));
        let detection = Arc::new(DetectionService::new(
            store.clone(),
            alerts.clone(),
            hub.clone(),
            source,
            encoder,
            config.stop_grace,
        ));
        let printer_poll = Arc::new(PrinterPollService::new(
            store.clone(),
            hub.clone(),
            connector,
            config.printer_poll_interval,
        ));
        let exemplar_cache = Arc::new(ExemplarCache::new(config.exemplar_cache_dir.clone()));

        tracing::info!("Engine wired");
        Self {
            config,
            store,
            hub,
            alerts,
            detection,
            printer_poll,
            exemplar_cache,
            notifier,
        }
    }

    /// Orderly shutdown: loops first so no new alerts appear, then
    /// polling, then cooldowns, then a final synchronous persist.
    pub async fn shutdown(&self) {
        self.detection.shutdown().await;
        self.printer_poll.shutdown().await;
        self.alerts.shutdown().await;
        if let Err(e) = self.store.persist_now().await {
            tracing::error!(error = %e, "Final state persist failed");
        }
        tracing::info!("Engine shut down");
    }
}
