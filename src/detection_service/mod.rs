//! DetectionService - Per-Camera Detection Loops
//!
//! ## Responsibilities
//!
//! - One capture/classify loop per running camera, spawned on demand
//! - Loop lifecycle: idempotent start, cooperative stop with a grace
//!   period, forced cancellation as the last resort
//! - Majority-vote alert triggering through the store's atomic claim
//!
//! Capture and inference are blocking, so each iteration moves the reader
//! into `spawn_blocking` and takes it back with the result. The reader is
//! owned by the loop task and closes its device in `Drop`, which covers
//! normal exit, read failure, and forced cancellation alike.

pub mod vote;

use crate::alert_service::AlertService;
use crate::camera_state_store::CameraStateStore;
use crate::error::{Error, Result};
use crate::exemplar_classifier::ExemplarSet;
use crate::frame_source::{apply_photometrics, FrameEncoder, FrameReader, FrameSource};
use crate::models::{CameraUpdate, Frame};
use crate::realtime_hub::{CameraStateMessage, HubMessage, RealtimeHub};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use vote::passed_majority_vote;

/// Outcome of one blocking capture/embed step
enum ReadOutcome {
    Frame(Frame, Vec<f32>),
    EmbedFailed(String),
    Eof,
    ReadFailed(Error),
}

/// DetectionService instance
pub struct DetectionService {
    store: Arc<CameraStateStore>,
    alerts: Arc<AlertService>,
    hub: Arc<RealtimeHub>,
    source: Arc<dyn FrameSource>,
    encoder: Arc<dyn FrameEncoder>,
    /// Shared classifier; replaced wholesale when exemplars are rebuilt
    exemplars: RwLock<Option<Arc<ExemplarSet>>>,
    /// Loop tasks keyed by camera id
    loops: Mutex<HashMap<String, JoinHandle<()>>>,
    stop_grace: Duration,
}

impl DetectionService {
    /// Create a new DetectionService
    pub fn new(
        store: Arc<CameraStateStore>,
        alerts: Arc<AlertService>,
        hub: Arc<RealtimeHub>,
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn FrameEncoder>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            store,
            alerts,
            hub,
            source,
            encoder,
            exemplars: RwLock::new(None),
            loops: Mutex::new(HashMap::new()),
            stop_grace,
        }
    }

    /// Install the classifier used by all loops
    pub async fn set_exemplar_set(&self, set: ExemplarSet) {
        tracing::info!(classes = ?set.class_names(), "Exemplar set installed");
        *self.exemplars.write().await = Some(Arc::new(set));
    }

    pub async fn exemplar_set(&self) -> Option<Arc<ExemplarSet>> {
        self.exemplars.read().await.clone()
    }

    /// Start the detection loop for a camera. Idempotent: a second start
    /// while the loop is alive is a no-op.
    pub async fn start(self: &Arc<Self>, camera_id: &str, source_ref: &str) -> Result<()> {
        if self.exemplars.read().await.is_none() {
            return Err(Error::Inference(
                "no exemplar set installed, cannot start detection".to_string(),
            ));
        }

        let mut loops = self.loops.lock().await;
        if let Some(handle) = loops.get(camera_id) {
            if !handle.is_finished() {
                tracing::debug!(camera_id = %camera_id, "Detection loop already running");
                return Ok(());
            }
        }

        // A new run starts clean: history, alert slot, and any recorded
        // error from the previous run are discarded; tunables survive
        self.store.reset_run_state(camera_id).await;
        self.store
            .update(
                camera_id,
                CameraUpdate::new().running(true).start_time(Some(Utc::now())),
            )
            .await?;

        tracing::info!(camera_id = %camera_id, source_ref = %source_ref, "Detection loop started");

        let service = self.clone();
        let id = camera_id.to_string();
        let source_ref = source_ref.to_string();
        let handle = tokio::spawn(async move {
            service.run_loop(&id, &source_ref).await;
        });
        loops.insert(camera_id.to_string(), handle);
        Ok(())
    }

    /// The per-camera loop body
    async fn run_loop(self: Arc<Self>, camera_id: &str, source_ref: &str) {
        let source = self.source.clone();
        let open_ref = source_ref.to_string();
        let opened = tokio::task::spawn_blocking(move || source.open(&open_ref)).await;

        let mut reader: Box<dyn FrameReader> = match opened {
            Ok(Ok(reader)) => reader,
            Ok(Err(e)) => {
                tracing::error!(camera_id = %camera_id, error = %e, "Failed to open capture source");
                self.record_failure(camera_id, &format!("capture open failed: {e}"))
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(camera_id = %camera_id, error = %e, "Capture open task failed");
                self.record_failure(camera_id, "capture open task failed")
                    .await;
                return;
            }
        };

        loop {
            let state = self.store.get(camera_id, false).await;
            if !state.running {
                tracing::info!(camera_id = %camera_id, "Detection loop stopping");
                break;
            }
            let Some(set) = self.exemplars.read().await.clone() else {
                self.record_failure(camera_id, "exemplar set removed while running")
                    .await;
                break;
            };

            let encoder = self.encoder.clone();
            let (brightness, contrast, focus) = (state.brightness, state.contrast, state.focus);
            let step = tokio::task::spawn_blocking(move || {
                let outcome = match reader.read() {
                    Ok(Some(mut frame)) => {
                        apply_photometrics(&mut frame, brightness, contrast, focus);
                        match encoder.embed(&frame) {
                            Ok(embedding) => ReadOutcome::Frame(frame, embedding),
                            Err(e) => ReadOutcome::EmbedFailed(e.to_string()),
                        }
                    }
                    Ok(None) => ReadOutcome::Eof,
                    Err(e) => ReadOutcome::ReadFailed(e),
                };
                (reader, outcome)
            })
            .await;

            let outcome = match step {
                Ok((r, outcome)) => {
                    reader = r;
                    outcome
                }
                Err(e) => {
                    // the reader was dropped with the panicked task, so the
                    // device is already released
                    tracing::error!(camera_id = %camera_id, error = %e, "Capture task failed");
                    self.record_failure(camera_id, "capture task failed").await;
                    return;
                }
            };

            match outcome {
                ReadOutcome::Frame(frame, embedding) => {
                    self.process_frame(camera_id, &set, frame, embedding).await;
                }
                ReadOutcome::EmbedFailed(reason) => {
                    // transient inference failure, skip this frame
                    tracing::warn!(camera_id = %camera_id, error = %reason, "Embedding failed, frame skipped");
                }
                ReadOutcome::Eof => {
                    tracing::info!(camera_id = %camera_id, "Capture stream ended");
                    break;
                }
                ReadOutcome::ReadFailed(e) => {
                    tracing::error!(camera_id = %camera_id, error = %e, "Frame read failed");
                    self.record_failure(camera_id, &format!("frame read failed: {e}"))
                        .await;
                    return;
                }
            }

            tokio::task::yield_now().await;
        }

        // cooperative exit; the reader drops here and releases the device
        if let Err(e) = self
            .store
            .update(camera_id, CameraUpdate::new().running(false))
            .await
        {
            tracing::warn!(camera_id = %camera_id, error = %e, "Could not mark camera stopped");
        }
        self.publish_state(camera_id).await;
    }

    /// Classify one frame, record it, and trigger the alert path
    async fn process_frame(
        self: &Arc<Self>,
        camera_id: &str,
        set: &Arc<ExemplarSet>,
        frame: Frame,
        embedding: Vec<f32>,
    ) {
        let state = self.store.get(camera_id, false).await;
        let Some(predicted) = set.classify(&embedding, state.sensitivity) else {
            return;
        };
        let Some(label) = set.label_of(predicted).map(str::to_string) else {
            return;
        };

        let now = Utc::now();
        let after_append = match self.store.append_detection(camera_id, &label, now).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(camera_id = %camera_id, error = %e, "Dropping sample for removed camera");
                return;
            }
        };
        if let Err(e) = self
            .store
            .update(
                camera_id,
                CameraUpdate::new()
                    .last_result(Some(label.clone()))
                    .last_time(Some(now)),
            )
            .await
        {
            tracing::warn!(camera_id = %camera_id, error = %e, "Could not record detection result");
            return;
        }
        self.publish_state(camera_id).await;

        let Some(defect_label) = set.defect_label() else {
            return;
        };
        if label != defect_label {
            return;
        }

        let passed = passed_majority_vote(
            &after_append.detection_history,
            after_append.majority_vote_window,
            after_append.majority_vote_threshold,
            defect_label,
        );
        if !passed {
            return;
        }

        // the claim decides a single winner; losers simply move on
        match self.store.try_claim_alert(camera_id).await {
            Ok(true) => {
                if let Err(e) = self.alerts.create(camera_id, &frame, now).await {
                    // create rolled the claim back already
                    tracing::error!(camera_id = %camera_id, error = %e, "Alert creation failed");
                }
            }
            Ok(false) => {
                tracing::trace!(camera_id = %camera_id, "Alert slot occupied, vote ignored");
            }
            Err(e) => {
                tracing::warn!(camera_id = %camera_id, error = %e, "Alert claim failed");
            }
        }
    }

    /// Stop a camera's loop; returns whether a loop was running.
    ///
    /// Sets the cooperative flag first, waits out the grace period, then
    /// force-cancels. History, last result, and any live alert survive.
    pub async fn stop(&self, camera_id: &str) -> bool {
        if let Err(e) = self
            .store
            .update(camera_id, CameraUpdate::new().running(false))
            .await
        {
            tracing::warn!(camera_id = %camera_id, error = %e, "Stop requested for unknown camera");
            return false;
        }

        let handle = self.loops.lock().await.remove(camera_id);
        let Some(handle) = handle else {
            return false;
        };
        if handle.is_finished() {
            return false;
        }

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.stop_grace, handle).await {
            Ok(_) => {
                tracing::info!(camera_id = %camera_id, "Detection loop stopped");
            }
            Err(_) => {
                tracing::warn!(camera_id = %camera_id, "Detection loop unresponsive, cancelling");
                abort.abort();
            }
        }
        true
    }

    /// Whether a camera currently has a live loop
    pub async fn is_running(&self, camera_id: &str) -> bool {
        self.loops
            .lock()
            .await
            .get(camera_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop every loop
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.loops.lock().await.keys().cloned().collect();
        for camera_id in ids {
            self.stop(&camera_id).await;
        }
    }

    async fn record_failure(&self, camera_id: &str, reason: &str) {
        if let Err(e) = self
            .store
            .update(
                camera_id,
                CameraUpdate::new()
                    .running(false)
                    .error(Some(reason.to_string())),
            )
            .await
        {
            tracing::warn!(camera_id = %camera_id, error = %e, "Could not record loop failure");
        }
        self.publish_state(camera_id).await;
    }

    async fn publish_state(&self, camera_id: &str) {
        let state = self.store.get(camera_id, false).await;
        self.hub.publish(HubMessage::CameraState(
            CameraStateMessage::from_state(camera_id, &state),
        ));
    }
}
