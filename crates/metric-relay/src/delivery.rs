// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of batches to the collector's `customprojectrawdata` endpoint.
//!
//! Two policies exist. [`DeliveryMode::Retry`] repeats the whole batch up to
//! `max_attempts` times with a fixed backoff and treats exhaustion as fatal.
//! [`DeliveryMode::Split`] serves legacy endpoints that reject oversized payloads:
//! after one failure the first half is tried, and if that succeeds the shared chunk
//! limit is halved for good and the second half follows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::batch::{ChunkLimit, OutgoingBatch};
use crate::config::CollectorConfig;
use crate::errors::{ConfigError, DeliveryError, TransportError};

pub const ENDPOINT_PATH: &str = "/customprojectrawdata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectType {
    #[default]
    Metric,
    MetricReplay,
}

impl ProjectType {
    #[must_use]
    pub fn agent_type(self) -> &'static str {
        match self {
            ProjectType::Metric => "CUSTOM",
            ProjectType::MetricReplay => "MetricFileReplay",
        }
    }

    #[must_use]
    pub fn is_replay(self) -> bool {
        self == ProjectType::MetricReplay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Retry,
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Form,
    Json,
}

/// Request body. `metricData` is the JSON-encoded row array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub license_key: String,
    pub user_name: String,
    pub project_name: String,
    pub instance_name: String,
    pub agent_type: String,
    pub sampling_interval: String,
    pub metric_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_serial_number: Option<String>,
}

/// Sends one envelope and reports the HTTP status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, envelope: &Envelope) -> Result<u16, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    encoding: PayloadEncoding,
}

impl ReqwestTransport {
    pub fn new(
        timeout: Duration,
        https_proxy: Option<&str>,
        encoding: PayloadEncoding,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = https_proxy.filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| TransportError::Build(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        Ok(ReqwestTransport {
            client: builder.build()?,
            encoding,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, url: &str, envelope: &Envelope) -> Result<u16, TransportError> {
        let request = self.client.post(url);
        let request = match self.encoding {
            PayloadEncoding::Form => request.form(envelope),
            PayloadEncoding::Json => request.json(envelope),
        };
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    pub base_url: String,
    pub license_key: String,
    pub user_name: String,
    pub project_name: String,
    pub project_type: ProjectType,
    pub instance_name: String,
    pub sampling_interval_secs: u64,
    pub mode: DeliveryMode,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub dry_run: bool,
}

impl DeliverySettings {
    pub fn from_config(
        collector: &CollectorConfig,
        instance_name: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(DeliverySettings {
            base_url: collector.url.clone(),
            license_key: collector.license_key.clone(),
            user_name: collector.user_name.clone(),
            project_name: collector.project_name.clone(),
            project_type: collector.project_type,
            instance_name: instance_name.into(),
            sampling_interval_secs: collector.sampling_interval_secs()?,
            mode: collector.delivery_mode,
            max_attempts: collector.max_attempts.max(1),
            backoff: Duration::from_secs(collector.retry_backoff_secs),
            dry_run: collector.dry_run,
        })
    }
}

pub struct DeliveryClient {
    settings: DeliverySettings,
    transport: Arc<dyn Transport>,
    chunk_limit: ChunkLimit,
    serial: AtomicU64,
}

impl DeliveryClient {
    #[must_use]
    pub fn new(
        settings: DeliverySettings,
        transport: Arc<dyn Transport>,
        chunk_limit: ChunkLimit,
    ) -> Self {
        DeliveryClient {
            settings,
            transport,
            chunk_limit,
            serial: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            ENDPOINT_PATH
        )
    }

    #[must_use]
    pub fn chunk_limit(&self) -> &ChunkLimit {
        &self.chunk_limit
    }

    /// Builds the request body for `batch`. Replay projects get a fresh chunk serial number.
    pub fn envelope(&self, batch: &OutgoingBatch) -> Result<Envelope, DeliveryError> {
        let settings = &self.settings;
        let metric_data = serde_json::to_string(&batch.metric_data())?;
        let replay = settings.project_type.is_replay();
        Ok(Envelope {
            license_key: settings.license_key.clone(),
            user_name: settings.user_name.clone(),
            project_name: settings.project_name.clone(),
            instance_name: settings.instance_name.clone(),
            agent_type: settings.project_type.agent_type().to_string(),
            sampling_interval: settings.sampling_interval_secs.to_string(),
            metric_data,
            min_timestamp: batch
                .min_timestamp
                .filter(|_| replay)
                .map(|ts| ts.to_string()),
            max_timestamp: batch
                .max_timestamp
                .filter(|_| replay)
                .map(|ts| ts.to_string()),
            chunk_serial_number: replay
                .then(|| self.serial.fetch_add(1, Ordering::Relaxed).to_string()),
        })
    }

    /// Delivers `batch` according to the configured mode.
    pub async fn deliver(&self, batch: &OutgoingBatch) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.settings.dry_run {
            let envelope = self.envelope(batch)?;
            info!(
                "Dry run, not sending {} rows to {}: {}",
                batch.len(),
                self.endpoint(),
                envelope.metric_data
            );
            return Ok(());
        }
        match self.settings.mode {
            DeliveryMode::Retry => self.send_with_retry(batch).await,
            DeliveryMode::Split => self.send_with_split(batch).await,
        }
    }

    async fn send_with_retry(&self, batch: &OutgoingBatch) -> Result<(), DeliveryError> {
        let envelope = self.envelope(batch)?;
        let url = self.endpoint();
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            match self.transport.post(&url, &envelope).await {
                Ok(200) => {
                    info!("Data sent successfully. Number of rows: {}", batch.len());
                    return Ok(());
                }
                Ok(status) => {
                    warn!(
                        "Attempt {}/{}: collector responded with status {}",
                        attempt, max_attempts, status
                    );
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{}: failed to send data: {}",
                        attempt, max_attempts, e
                    );
                }
            }
            if attempt < max_attempts {
                debug!("waiting {:?} before resending", self.settings.backoff);
                tokio::time::sleep(self.settings.backoff).await;
            }
        }

        error!(
            "Failed to send {} rows after {} attempts",
            batch.len(),
            max_attempts
        );
        Err(DeliveryError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    async fn send_once(&self, batch: &OutgoingBatch) -> Result<bool, DeliveryError> {
        let envelope = self.envelope(batch)?;
        match self.transport.post(&self.endpoint(), &envelope).await {
            Ok(200) => {
                info!("{} rows are reported", batch.len());
                Ok(true)
            }
            Ok(status) => {
                warn!("collector responded with status {}", status);
                Ok(false)
            }
            Err(e) => {
                warn!("failed to send data: {}", e);
                Ok(false)
            }
        }
    }

    async fn send_with_split(&self, batch: &OutgoingBatch) -> Result<(), DeliveryError> {
        if self.send_once(batch).await? {
            return Ok(());
        }
        let Some((first, second)) = batch.split() else {
            error!("Failed to send data; a single row cannot be split");
            return Err(DeliveryError::Rejected {
                records: batch.len(),
            });
        };
        warn!("Failed to send data. Retrying once with half of the chunk.");
        if !self.send_once(&first).await? {
            error!("Failed to send data.");
            return Err(DeliveryError::Rejected {
                records: batch.len(),
            });
        }
        let lines = self.chunk_limit.halve();
        info!("Reduced chunk size to {} rows", lines);
        if !self.send_once(&second).await? {
            error!("Failed to send the second half of the chunk.");
            return Err(DeliveryError::Rejected {
                records: second.len(),
            });
        }
        Ok(())
    }
}
