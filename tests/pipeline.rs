//! End-to-end pipeline tests: scripted frames in, alerts and printer
//! commands out, through the fully wired engine.

use chrono::Utc;
use printwatch::camera_state_store::CameraStateStore;
use printwatch::config::AppConfig;
use printwatch::error::Result;
use printwatch::exemplar_classifier::ExemplarSet;
use printwatch::frame_source::{FrameEncoder, FrameReader, FrameSource};
use printwatch::models::{AlertAction, CameraUpdate, Frame, PrinterConfig};
use printwatch::notification_service::WebhookNotifier;
use printwatch::printer_client::{
    JobInfo, JobProgress, PrinterConnector, PrinterControl, TemperatureReading,
};
use printwatch::realtime_hub::HubMessage;
use printwatch::state::AppState;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFECT_MARK: u8 = 255;

fn marked_frame(marker: u8) -> Frame {
    let mut pixels = vec![0u8; 4 * 4 * 3];
    pixels[0] = marker;
    Frame {
        width: 4,
        height: 4,
        pixels,
    }
}

struct ScriptedReader {
    frames: VecDeque<Frame>,
    endless_mark: Option<u8>,
    closes: Arc<AtomicUsize>,
}

impl FrameReader for ScriptedReader {
    fn read(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }
        if let Some(mark) = self.endless_mark {
            std::thread::sleep(Duration::from_millis(2));
            return Ok(Some(marked_frame(mark)));
        }
        Ok(None)
    }
}

impl Drop for ScriptedReader {
    fn drop(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedSource {
    frames: Vec<Frame>,
    endless_mark: Option<u8>,
    closes: Arc<AtomicUsize>,
}

impl FrameSource for ScriptedSource {
    fn open(&self, _source_ref: &str) -> Result<Box<dyn FrameReader>> {
        Ok(Box::new(ScriptedReader {
            frames: self.frames.clone().into(),
            endless_mark: self.endless_mark,
            closes: self.closes.clone(),
        }))
    }
}

/// First pixel becomes the 1-d embedding
struct MarkerEncoder;

impl FrameEncoder for MarkerEncoder {
    fn embed(&self, frame: &Frame) -> Result<Vec<f32>> {
        Ok(vec![f32::from(frame.pixels[0]) / 255.0])
    }
}

struct ScriptedPrinter {
    printing: bool,
    cancels: Arc<AtomicUsize>,
    pauses: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl PrinterControl for ScriptedPrinter {
    async fn get_job_info(&self) -> Result<JobInfo> {
        Ok(JobInfo {
            state: if self.printing {
                "Printing".into()
            } else {
                "Operational".into()
            },
            progress: JobProgress::default(),
        })
    }
    async fn cancel_job(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn pause_job(&self) -> Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn get_temperatures(&self) -> Result<HashMap<String, TemperatureReading>> {
        let mut temps = HashMap::new();
        temps.insert(
            "tool0".to_string(),
            TemperatureReading {
                actual: Some(210.0),
                target: Some(210.0),
            },
        );
        Ok(temps)
    }
}

struct ScriptedConnector {
    printing: bool,
    cancels: Arc<AtomicUsize>,
    pauses: Arc<AtomicUsize>,
}

impl PrinterConnector for ScriptedConnector {
    fn connect(&self, _config: &PrinterConfig) -> Result<Box<dyn PrinterControl>> {
        Ok(Box::new(ScriptedPrinter {
            printing: self.printing,
            cancels: self.cancels.clone(),
            pauses: self.pauses.clone(),
        }))
    }
}

fn exemplars() -> ExemplarSet {
    ExemplarSet::build(
        &[
            ("success".to_string(), vec![vec![0.0]]),
            ("failure".to_string(), vec![vec![1.0]]),
        ],
        "success",
    )
    .unwrap()
}

struct Rig {
    app: AppState,
    closes: Arc<AtomicUsize>,
    cancels: Arc<AtomicUsize>,
    pauses: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

async fn rig(frames: Vec<Frame>, endless_mark: Option<u8>, printing: bool) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        state_path: dir.path().join("states.json"),
        exemplar_cache_dir: dir.path().join("exemplars"),
        printer_poll_interval: Duration::from_millis(20),
        stop_grace: Duration::from_millis(500),
        ..AppConfig::default()
    };

    let closes = Arc::new(AtomicUsize::new(0));
    let cancels = Arc::new(AtomicUsize::new(0));
    let pauses = Arc::new(AtomicUsize::new(0));
    let app = AppState::with_seams(
        config,
        Arc::new(ScriptedSource {
            frames,
            endless_mark,
            closes: closes.clone(),
        }),
        Arc::new(MarkerEncoder),
        Arc::new(WebhookNotifier::new()),
        Arc::new(ScriptedConnector {
            printing,
            cancels: cancels.clone(),
            pauses: pauses.clone(),
        }),
    )
    .await;
    app.detection.set_exemplar_set(exemplars()).await;

    Rig {
        app,
        closes,
        cancels,
        pauses,
        _dir: dir,
    }
}

async fn bind_printer(store: &CameraStateStore, camera_id: &str) {
    store.get(camera_id, false).await;
    store
        .update(
            camera_id,
            CameraUpdate::new().printer_config(Some(PrinterConfig {
                name: "prusa".into(),
                base_url: "http://localhost:5000".into(),
                api_key: "key".into(),
                printer_type: "octoprint".into(),
            })),
        )
        .await
        .unwrap();
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_defect_stream_raises_one_alert() {
    let r = rig(vec![marked_frame(DEFECT_MARK); 8], None, false).await;
    let mut rx = r.app.hub.subscribe();

    r.app.detection.start("cam-1", "video0").await.unwrap();
    wait_for("detection loop to finish", || async {
        !r.app.detection.is_running("cam-1").await
    })
    .await;

    // exactly one alert despite 8 defect frames
    let alerts = r.app.alerts.list().await;
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.camera_id, "cam-1");
    // JPEG SOI marker
    assert_eq!(&alert.snapshot[..2], &[0xFF, 0xD8]);

    // the hub saw the alert event
    let mut saw_alert = false;
    while let Ok(msg) = rx.try_recv() {
        if let HubMessage::Alert(m) = msg {
            assert_eq!(m.alert_id, alert.id);
            saw_alert = true;
        }
    }
    assert!(saw_alert);

    // device handle released exactly once
    assert_eq!(r.closes.load(Ordering::SeqCst), 1);

    r.app.shutdown().await;
    // final persist wrote the snapshot
    assert!(r.app.config.state_path.exists());
}

#[tokio::test]
async fn test_cooldown_cancels_active_print() {
    let r = rig(Vec::new(), Some(DEFECT_MARK), true).await;
    bind_printer(&r.app.store, "cam-1").await;
    r.app
        .store
        .update(
            "cam-1",
            CameraUpdate::new()
                .countdown_time(1)
                .countdown_action(AlertAction::CancelPrint),
        )
        .await
        .unwrap();

    r.app.detection.start("cam-1", "video0").await.unwrap();
    wait_for("alert to be raised", || async {
        !r.app.alerts.list().await.is_empty()
    })
    .await;
    // halt the loop so the resolved slot is not immediately re-claimed
    assert!(r.app.detection.stop("cam-1").await);

    // the 1s cooldown expires, cancels the job, and resolves the alert
    wait_for("cooldown to cancel the print", || async {
        r.cancels.load(Ordering::SeqCst) == 1
    })
    .await;
    wait_for("alert to resolve", || async {
        r.app.alerts.list().await.is_empty()
    })
    .await;
    assert_eq!(r.pauses.load(Ordering::SeqCst), 0);
    assert!(r.app.store.get("cam-1", false).await.alert_slot.is_none());

    r.app.shutdown().await;
    assert_eq!(r.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_manual_dismiss_preempts_cooldown_action() {
    let r = rig(Vec::new(), Some(DEFECT_MARK), true).await;
    bind_printer(&r.app.store, "cam-1").await;
    r.app
        .store
        .update(
            "cam-1",
            CameraUpdate::new()
                .countdown_time(1)
                .countdown_action(AlertAction::CancelPrint),
        )
        .await
        .unwrap();

    r.app.detection.start("cam-1", "video0").await.unwrap();
    wait_for("alert to be raised", || async {
        !r.app.alerts.list().await.is_empty()
    })
    .await;
    assert!(r.app.detection.stop("cam-1").await);

    let alert_id = r.app.alerts.list().await[0].id.clone();
    assert!(r.app.alerts.dismiss(&alert_id).await);
    assert!(r.app.alerts.list().await.is_empty());

    // well past the aborted cooldown: the cancel must never fire
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(r.cancels.load(Ordering::SeqCst), 0);

    // the slot is free for the next defect episode
    assert!(r.app.store.try_claim_alert("cam-1").await.unwrap());

    r.app.shutdown().await;
}

#[tokio::test]
async fn test_printer_polling_publishes_telemetry() {
    let r = rig(Vec::new(), None, true).await;
    bind_printer(&r.app.store, "cam-1").await;
    let mut rx = r.app.hub.subscribe();

    assert!(r.app.printer_poll.start("cam-1").await);
    let msg = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let HubMessage::PrinterState(m) = rx.recv().await.unwrap() {
                return m;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(msg.camera_id, "cam-1");
    assert!(msg.state.job.as_ref().unwrap().is_printing());
    assert!(msg.state.temperatures.contains_key("tool0"));

    r.app.shutdown().await;
    assert!(!r.app.printer_poll.is_polling("cam-1").await);
}

#[tokio::test]
async fn test_states_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        state_path: dir.path().join("states.json"),
        exemplar_cache_dir: dir.path().join("exemplars"),
        ..AppConfig::default()
    };

    let build = |config: AppConfig| {
        AppState::with_seams(
            config,
            Arc::new(ScriptedSource {
                frames: Vec::new(),
                endless_mark: None,
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(MarkerEncoder),
            Arc::new(WebhookNotifier::new()),
            Arc::new(ScriptedConnector {
                printing: false,
                cancels: Arc::new(AtomicUsize::new(0)),
                pauses: Arc::new(AtomicUsize::new(0)),
            }),
        )
    };

    let app = build(config.clone()).await;
    app.store.get("cam-1", false).await;
    app.store
        .update("cam-1", CameraUpdate::new().sensitivity(1.4))
        .await
        .unwrap();
    app.store
        .append_detection("cam-1", "success", Utc::now())
        .await
        .unwrap();
    app.shutdown().await;

    let reloaded = build(config).await;
    let state = reloaded.store.get("cam-1", false).await;
    assert_eq!(state.sensitivity, 1.4);
    assert_eq!(state.detection_history.len(), 1);
    assert!(!state.running);
}
