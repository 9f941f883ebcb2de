//! printwatch - Print Defect Monitoring Engine
//!
//! Watches camera feeds pointed at running 3D prints, classifies each
//! frame against exemplar embeddings, debounces defect classifications
//! through a majority vote, and raises at most one live alert per camera.
//! Alerts auto-resolve after a cooldown by dismissing or suspending the
//! bound printer's job.
//!
//! ## Components
//!
//! - `camera_state_store`: concurrent per-camera state with persistence
//! - `exemplar_classifier`: nearest-centroid classification with a
//!   sensitivity-biased defect override
//! - `detection_service`: per-camera capture/classify loops and the
//!   majority-vote trigger
//! - `alert_service`: alert lifecycle, cooldowns, printer suspension
//! - `printer_poll_service`: printer telemetry polling
//! - `realtime_hub`: bounded fan-out of engine events
//! - `notification_service`: webhook push delivery
//!
//! Capture devices and embedding models are injected through the
//! `frame_source` traits; `state::AppState` wires everything together.

pub mod alert_service;
pub mod camera_state_store;
pub mod config;
pub mod detection_service;
pub mod error;
pub mod exemplar_classifier;
pub mod frame_source;
pub mod models;
pub mod notification_service;
pub mod printer_client;
pub mod printer_poll_service;
pub mod realtime_hub;
pub mod state;
pub mod state_persistence;

pub use error::{Error, Result};
