//! NotificationService - Outbound Push Dispatch
//!
//! ## Responsibilities
//!
//! - `Notifier` seam for alert push delivery
//! - Webhook implementation posting alert payloads to registered
//!   endpoints, pruning endpoints that report themselves gone
//!
//! Delivery is best-effort: the alert lifecycle never waits on or fails
//! because of a notifier.

use crate::models::Alert;
use async_trait::async_trait;
use base64::Engine as _;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::RwLock;

/// Push dispatch seam
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert notification; returns whether every target accepted it
    async fn send(&self, alert: &Alert) -> bool;
}

/// Payload posted to webhook endpoints
#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    alert_id: &'a str,
    camera_id: &'a str,
    title: &'a str,
    message: &'a str,
    timestamp: String,
    countdown_time: u64,
    /// Base64 JPEG snapshot
    snapshot: String,
}

/// Webhook notifier with endpoint registry.
///
/// An endpoint answering HTTP 410 Gone is treated as permanently expired
/// and removed from the registry; other failures are logged and the
/// endpoint retried on the next alert.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoints: RwLock<Vec<String>>,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoints: RwLock::new(Vec::new()),
        }
    }

    /// Register a delivery endpoint (idempotent)
    pub async fn add_endpoint(&self, url: &str) {
        let mut endpoints = self.endpoints.write().await;
        if !endpoints.iter().any(|e| e == url) {
            endpoints.push(url.to_string());
            tracing::info!(endpoint = %url, "Notification endpoint registered");
        }
    }

    /// Remove a delivery endpoint
    pub async fn remove_endpoint(&self, url: &str) -> bool {
        let mut endpoints = self.endpoints.write().await;
        let before = endpoints.len();
        endpoints.retain(|e| e != url);
        before != endpoints.len()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &Alert) -> bool {
        let targets = self.endpoints.read().await.clone();
        if targets.is_empty() {
            tracing::debug!(alert_id = %alert.id, "No notification endpoints registered");
            return true;
        }

        let payload = AlertPayload {
            alert_id: &alert.id,
            camera_id: &alert.camera_id,
            title: &alert.title,
            message: &alert.message,
            timestamp: alert.timestamp.to_rfc3339(),
            countdown_time: alert.countdown_time,
            snapshot: base64::engine::general_purpose::STANDARD.encode(&alert.snapshot),
        };

        let mut all_delivered = true;
        let mut expired = Vec::new();
        for endpoint in &targets {
            match self.client.post(endpoint).json(&payload).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::GONE => {
                    tracing::debug!(endpoint = %endpoint, "Endpoint expired, pruning");
                    expired.push(endpoint.clone());
                    all_delivered = false;
                }
                Ok(resp) if !resp.status().is_success() => {
                    tracing::error!(
                        endpoint = %endpoint,
                        status = %resp.status(),
                        "Notification push rejected"
                    );
                    all_delivered = false;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(endpoint = %endpoint, error = %e, "Notification push failed");
                    all_delivered = false;
                }
            }
        }

        if !expired.is_empty() {
            let mut endpoints = self.endpoints.write().await;
            endpoints.retain(|e| !expired.contains(e));
        }

        all_delivered
    }
}
