//! CameraStateStore - Concurrent Per-Camera State
//!
//! ## Responsibilities
//!
//! - Per-camera runtime state, one fine-grained lock per camera
//! - Typed partial updates and detection history appends
//! - Atomic alert-slot claim (single alert per camera)
//! - Best-effort asynchronous persistence snapshots
//!
//! A coarse lock guards the camera map only while a new camera id is
//! registered; steady-state reads and writes take only the per-camera
//! lock, so one camera's mutation never blocks another's.

use crate::error::{Error, Result};
use crate::models::{AlertSlot, CameraState, CameraUpdate, DetectionSample};
use crate::state_persistence::StatePersistence;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// CameraStateStore instance
pub struct CameraStateStore {
    /// Per-camera state entries; the outer lock is held only for lookup
    /// and first-time insertion
    entries: RwLock<HashMap<String, Arc<Mutex<CameraState>>>>,
    persistence: Arc<dyn StatePersistence>,
    history_cap: usize,
    persist_every: usize,
}

impl CameraStateStore {
    /// Create a new store
    pub fn new(
        persistence: Arc<dyn StatePersistence>,
        history_cap: usize,
        persist_every: usize,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            persistence,
            history_cap,
            persist_every: persist_every.max(1),
        }
    }

    /// Load persisted states, replacing the current map.
    ///
    /// Called once at startup; load failures leave the store empty.
    pub async fn load(&self) {
        match self.persistence.load_states().await {
            Ok(loaded) => {
                let mut entries = self.entries.write().await;
                entries.clear();
                let count = loaded.len();
                for (camera_id, state) in loaded {
                    entries.insert(camera_id, Arc::new(Mutex::new(state)));
                }
                tracing::info!(cameras = count, "Camera states loaded");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load camera states, starting empty");
            }
        }
    }

    /// Get a camera's state, creating a fresh default when the camera is
    /// unknown or `reset` is set. Creation and reset persist immediately.
    pub async fn get(&self, camera_id: &str, reset: bool) -> CameraState {
        if !reset {
            if let Some(entry) = self.entry(camera_id).await {
                return entry.lock().await.clone();
            }
        }

        let entry = self.get_or_create_entry(camera_id).await;
        let state = {
            let mut guard = entry.lock().await;
            if reset {
                *guard = CameraState::default();
            }
            guard.clone()
        };
        self.spawn_persist().await;
        state
    }

    /// Reset a camera's run state for a fresh detection run: history,
    /// alert slot, error, and last-result fields are cleared; tunables
    /// and the printer binding survive. Creates the camera when unknown.
    pub async fn reset_run_state(&self, camera_id: &str) -> CameraState {
        let entry = self.get_or_create_entry(camera_id).await;
        let state = {
            let mut guard = entry.lock().await;
            guard.detection_history.clear();
            guard.alert_slot = None;
            guard.error = None;
            guard.last_result = None;
            guard.last_time = None;
            guard.start_time = None;
            guard.clone()
        };
        self.spawn_persist().await;
        state
    }

    /// Apply a typed partial update under the camera's lock
    pub async fn update(&self, camera_id: &str, update: CameraUpdate) -> Result<CameraState> {
        let entry = self
            .entry(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {camera_id}")))?;

        let state = {
            let mut guard = entry.lock().await;
            update.apply(&mut guard);
            guard.clone()
        };
        self.spawn_persist().await;
        Ok(state)
    }

    /// Append one detection sample, evicting the oldest entries beyond the
    /// cap. Persists on every `persist_every`th append.
    pub async fn append_detection(
        &self,
        camera_id: &str,
        label: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<CameraState> {
        let entry = self
            .entry(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {camera_id}")))?;

        let (state, persist) = {
            let mut guard = entry.lock().await;
            guard.detection_history.push_back(DetectionSample {
                timestamp,
                label: label.to_string(),
            });
            while guard.detection_history.len() > self.history_cap {
                guard.detection_history.pop_front();
            }
            // the cadence counts appends, not the (capped) history length
            guard.append_seq += 1;
            let persist = guard.append_seq % self.persist_every as u64 == 0;
            (guard.clone(), persist)
        };

        if persist {
            self.spawn_persist().await;
        }
        Ok(state)
    }

    /// All known camera ids
    pub async fn list_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Remove a camera and its state entirely
    pub async fn remove(&self, camera_id: &str) -> bool {
        let removed = self.entries.write().await.remove(camera_id).is_some();
        if removed {
            tracing::info!(camera_id = %camera_id, "Camera removed");
            self.spawn_persist().await;
        } else {
            tracing::warn!(camera_id = %camera_id, "Attempted to remove unknown camera");
        }
        removed
    }

    /// Atomically claim the camera's alert slot.
    ///
    /// Compare-and-set `None` -> `Claimed` under the per-camera lock;
    /// returns `true` only for the single winning caller. The claim is
    /// later replaced by the alert id or rolled back.
    pub async fn try_claim_alert(&self, camera_id: &str) -> Result<bool> {
        let entry = self
            .entry(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {camera_id}")))?;

        let mut guard = entry.lock().await;
        if guard.alert_slot.is_none() {
            guard.alert_slot = Some(AlertSlot::Claimed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Replace a claim (or anything else) with the active alert id
    pub async fn set_active_alert(&self, camera_id: &str, alert_id: &str) -> Result<()> {
        let entry = self
            .entry(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {camera_id}")))?;
        entry.lock().await.alert_slot = Some(AlertSlot::Active(alert_id.to_string()));
        Ok(())
    }

    /// Roll back a claim that never became an alert
    pub async fn release_claim(&self, camera_id: &str) {
        if let Some(entry) = self.entry(camera_id).await {
            let mut guard = entry.lock().await;
            if guard.alert_slot == Some(AlertSlot::Claimed) {
                guard.alert_slot = None;
            }
        }
    }

    /// Clear the alert slot (alert resolved)
    pub async fn clear_alert(&self, camera_id: &str) {
        if let Some(entry) = self.entry(camera_id).await {
            entry.lock().await.alert_slot = None;
        }
    }

    async fn entry(&self, camera_id: &str) -> Option<Arc<Mutex<CameraState>>> {
        self.entries.read().await.get(camera_id).cloned()
    }

    /// Get the per-camera entry, creating it if absent
    async fn get_or_create_entry(&self, camera_id: &str) -> Arc<Mutex<CameraState>> {
        // Read lock first; the common case is an existing camera
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(camera_id) {
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().await;
        entries
            .entry(camera_id.to_string())
            .or_insert_with(|| {
                tracing::info!(camera_id = %camera_id, "Camera registered");
                Arc::new(Mutex::new(CameraState::default()))
            })
            .clone()
    }

    /// Snapshot all states and persist in the background; failures are
    /// logged and the in-memory copy stays authoritative.
    async fn spawn_persist(&self) {
        let snapshot = self.snapshot().await;
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.save_states(&snapshot).await {
                tracing::warn!(error = %e, "Camera state persistence failed");
            }
        });
    }

    /// Persist synchronously; used at shutdown where a spawned task could
    /// be dropped with the runtime
    pub async fn persist_now(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        self.persistence.save_states(&snapshot).await
    }

    /// Clone every camera state under its own lock
    pub async fn snapshot(&self) -> HashMap<String, CameraState> {
        let entries: Vec<(String, Arc<Mutex<CameraState>>)> = {
            let map = self.entries.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut snapshot = HashMap::with_capacity(entries.len());
        for (camera_id, entry) in entries {
            snapshot.insert(camera_id, entry.lock().await.clone());
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Persistence stub counting saves
    struct CountingPersistence {
        saves: AtomicUsize,
    }

    impl CountingPersistence {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                saves: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl StatePersistence for CountingPersistence {
        async fn load_states(&self) -> Result<HashMap<String, CameraState>> {
            Ok(HashMap::new())
        }

        async fn save_states(&self, _states: &HashMap<String, CameraState>) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn store_with(cap: usize, every: usize) -> CameraStateStore {
        CameraStateStore::new(CountingPersistence::new(), cap, every)
    }

    #[tokio::test]
    async fn test_get_creates_default_state() {
        let store = store_with(100, 100);
        let state = store.get("cam-1", false).await;
        assert_eq!(state.brightness, 1.0);
        assert!(!state.running);
        assert_eq!(store.list_ids().await, vec!["cam-1".to_string()]);
    }

    #[tokio::test]
    async fn test_get_reset_discards_history() {
        let store = store_with(100, 100);
        store.get("cam-1", false).await;
        store
            .append_detection("cam-1", "failure", Utc::now())
            .await
            .unwrap();

        let state = store.get("cam-1", true).await;
        assert!(state.detection_history.is_empty());
    }

    #[tokio::test]
    async fn test_reset_run_state_preserves_tunables() {
        let store = store_with(100, 100);
        store.get("cam-1", false).await;
        store
            .update("cam-1", CameraUpdate::new().sensitivity(1.5).error(Some("old".into())))
            .await
            .unwrap();
        store
            .append_detection("cam-1", "failure", Utc::now())
            .await
            .unwrap();
        assert!(store.try_claim_alert("cam-1").await.unwrap());

        let state = store.reset_run_state("cam-1").await;
        assert!(state.detection_history.is_empty());
        assert!(state.alert_slot.is_none());
        assert!(state.error.is_none());
        assert_eq!(state.sensitivity, 1.5);
    }

    #[tokio::test]
    async fn test_update_unknown_camera_is_not_found() {
        let store = store_with(100, 100);
        let result = store.update("ghost", CameraUpdate::new().brightness(2.0)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_append_evicts_oldest_beyond_cap() {
        let store = store_with(3, 1000);
        store.get("cam-1", false).await;
        for i in 0..5 {
            store
                .append_detection("cam-1", &format!("s{i}"), Utc::now())
                .await
                .unwrap();
        }
        let state = store.get("cam-1", false).await;
        assert_eq!(state.detection_history.len(), 3);
        assert_eq!(state.detection_history.front().unwrap().label, "s2");
        assert_eq!(state.detection_history.back().unwrap().label, "s4");
    }

    #[tokio::test]
    async fn test_append_persists_every_nth() {
        let persistence = CountingPersistence::new();
        let store = CameraStateStore::new(persistence.clone(), 1000, 3);
        store.get("cam-1", false).await; // one save for creation
        for _ in 0..7 {
            store
                .append_detection("cam-1", "success", Utc::now())
                .await
                .unwrap();
        }
        // yield so spawned persist tasks run
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // creation + appends 3 and 6
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persist_cadence_survives_capped_history() {
        let persistence = CountingPersistence::new();
        // history pinned at 4 entries well before the appends end
        let store = CameraStateStore::new(persistence.clone(), 4, 2);
        store.get("cam-1", false).await; // one save for creation
        for _ in 0..10 {
            store
                .append_detection("cam-1", "success", Utc::now())
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // creation + every 2nd of 10 appends, not one per append
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_under_contention() {
        let store = Arc::new(store_with(100, 100));
        store.get("cam-1", false).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_claim_alert("cam-1").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        let store = store_with(100, 100);
        store.get("cam-1", false).await;

        assert!(store.try_claim_alert("cam-1").await.unwrap());
        assert!(!store.try_claim_alert("cam-1").await.unwrap());

        store.set_active_alert("cam-1", "cam-1_abc").await.unwrap();
        let state = store.get("cam-1", false).await;
        assert_eq!(state.current_alert_id(), Some("cam-1_abc"));

        // release_claim must not disturb an active alert
        store.release_claim("cam-1").await;
        let state = store.get("cam-1", false).await;
        assert_eq!(state.current_alert_id(), Some("cam-1_abc"));

        store.clear_alert("cam-1").await;
        assert!(store.try_claim_alert("cam-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_claim_rolls_back() {
        let store = store_with(100, 100);
        store.get("cam-1", false).await;
        assert!(store.try_claim_alert("cam-1").await.unwrap());
        store.release_claim("cam-1").await;
        assert!(store.try_claim_alert("cam-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_camera() {
        let store = store_with(100, 100);
        store.get("cam-1", false).await;
        assert!(store.remove("cam-1").await);
        assert!(!store.remove("cam-1").await);
        assert!(store.list_ids().await.is_empty());
    }
}
