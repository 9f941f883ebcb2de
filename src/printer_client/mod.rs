//! PrinterClient - Printer REST Adapter
//!
//! ## Responsibilities
//!
//! - `PrinterControl` seam for job queries and job commands
//! - OctoPrint implementation over its REST API

use crate::error::{Error, Result};
use crate::models::PrinterConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Printer job state and progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// e.g. "Printing", "Operational", "Paused"
    pub state: String,
    #[serde(default)]
    pub progress: JobProgress,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    #[serde(default)]
    pub completion: Option<f64>,
    #[serde(default)]
    pub print_time: Option<u64>,
    #[serde(default)]
    pub print_time_left: Option<u64>,
}

impl JobInfo {
    pub fn is_printing(&self) -> bool {
        self.state == "Printing"
    }
}

/// One temperature sensor reading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureReading {
    #[serde(default)]
    pub actual: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
}

/// Combined telemetry published on the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterState {
    #[serde(default)]
    pub job: Option<JobInfo>,
    #[serde(default)]
    pub temperatures: HashMap<String, TemperatureReading>,
}

/// Printer control seam
#[async_trait]
pub trait PrinterControl: Send + Sync {
    async fn get_job_info(&self) -> Result<JobInfo>;
    async fn cancel_job(&self) -> Result<()>;
    async fn pause_job(&self) -> Result<()>;
    async fn get_temperatures(&self) -> Result<HashMap<String, TemperatureReading>>;

    /// Full telemetry; a failed job query degrades to temperatures only
    async fn get_printer_state(&self) -> Result<PrinterState> {
        let temperatures = self.get_temperatures().await?;
        let job = match self.get_job_info().await {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::debug!(error = %e, "Job info unavailable");
                None
            }
        };
        Ok(PrinterState { job, temperatures })
    }
}

/// Builds `PrinterControl` handles from a camera's printer binding.
///
/// The alert and polling services connect lazily through this seam so
/// tests can substitute a scripted printer.
pub trait PrinterConnector: Send + Sync {
    fn connect(&self, config: &PrinterConfig) -> Result<Box<dyn PrinterControl>>;
}

/// Connector producing OctoPrint clients
pub struct OctoPrintConnector;

impl PrinterConnector for OctoPrintConnector {
    fn connect(&self, config: &PrinterConfig) -> Result<Box<dyn PrinterControl>> {
        Ok(Box::new(OctoPrintClient::from_config(config)?))
    }
}

/// OctoPrint REST client
pub struct OctoPrintClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OctoPrintClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Build a client from a camera's printer binding
    pub fn from_config(config: &PrinterConfig) -> Result<Self> {
        if config.printer_type != "octoprint" {
            return Err(Error::Printer(format!(
                "unsupported printer type: {}",
                config.printer_type
            )));
        }
        Ok(Self::new(&config.base_url, &config.api_key))
    }

    async fn job_command(&self, command: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/api/job", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await?;

        // OctoPrint answers job commands with 204 No Content
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OctoJobResponse {
    state: String,
    #[serde(default)]
    progress: JobProgress,
}

#[derive(Debug, Deserialize)]
struct OctoPrinterResponse {
    #[serde(default)]
    temperature: HashMap<String, TemperatureReading>,
}

#[async_trait]
impl PrinterControl for OctoPrintClient {
    async fn get_job_info(&self) -> Result<JobInfo> {
        let resp = self
            .client
            .get(format!("{}/api/job", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?;

        let job: OctoJobResponse = resp.json().await?;
        Ok(JobInfo {
            state: job.state,
            progress: job.progress,
        })
    }

    async fn cancel_job(&self) -> Result<()> {
        self.job_command("cancel").await
    }

    async fn pause_job(&self) -> Result<()> {
        self.job_command("pause").await
    }

    async fn get_temperatures(&self) -> Result<HashMap<String, TemperatureReading>> {
        let resp = self
            .client
            .get(format!("{}/api/printer", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        // 409 means the printer is not operational; report no readings
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(HashMap::new());
        }
        let printer: OctoPrinterResponse = resp.error_for_status()?.json().await?;
        Ok(printer.temperature)
    }
}
