mod submitter;

pub use submitter::Submitter;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mod_connect_core::{config::IngestConfig, models::SubmissionUnit, retry::ErrorClass};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    /// Remote validation failure. Not retried.
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("rate limited by ingestion API")]
    RateLimited,
    #[error("transient server error: {0}")]
    Transient(String),
    #[error("submission timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected(_) | Self::Other(_) => ErrorClass::Terminal,
            Self::RateLimited | Self::Transient(_) => ErrorClass::Retryable,
            Self::Timeout => ErrorClass::Timeout,
        }
    }
}

/// Wire form of a [`SubmissionUnit`]. The (identity, revision) key is what
/// the remote dedupes on, so it is sent unchanged across retries; the local
/// attempt counter never goes over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitEnvelope {
    pub provider: String,
    pub organization: String,
    pub name: String,
    pub revision: String,
    pub payload: serde_json::Value,
}

impl From<&SubmissionUnit> for UnitEnvelope {
    fn from(unit: &SubmissionUnit) -> Self {
        Self {
            provider: unit.descriptor.id.provider.clone(),
            organization: unit.descriptor.id.organization.clone(),
            name: unit.descriptor.id.name.clone(),
            revision: unit.revision.clone(),
            payload: unit.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Per-unit response entry, keyed by the same identity + revision as the
/// submitted envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitAck {
    pub provider: String,
    pub organization: String,
    pub name: String,
    pub revision: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl UnitAck {
    pub fn matches(&self, unit: &SubmissionUnit) -> bool {
        self.provider == unit.descriptor.id.provider
            && self.organization == unit.descriptor.id.organization
            && self.name == unit.descriptor.id.name
            && self.revision == unit.revision
    }
}

/// Seam between the pipeline and the ingestion API, so orchestration tests
/// can run against in-memory fakes.
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Host submissions go out to, for per-host concurrency limits.
    fn host(&self) -> &str;

    /// Submit one batch. Per-unit failures come back as rejected acks; an
    /// `Err` means the call as a whole failed.
    async fn submit(&self, units: &[SubmissionUnit]) -> Result<Vec<UnitAck>, IngestError>;
}

pub struct HttpIngestClient {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
    host: String,
}

impl HttpIngestClient {
    /// `token` is a bearer credential supplied by the environment.
    pub fn new(config: &IngestConfig, token: Option<String>) -> Result<Self> {
        let url = config.url.clone().context("ingest.url must be configured")?;
        let host = url.host_str().context("ingest.url has no host")?.to_string();
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to create ingest client")?;
        Ok(Self { client, url, token, host })
    }
}

#[async_trait]
impl IngestSink for HttpIngestClient {
    fn host(&self) -> &str { &self.host }

    async fn submit(&self, units: &[SubmissionUnit]) -> Result<Vec<UnitAck>, IngestError> {
        let envelopes: Vec<UnitEnvelope> = units.iter().map(UnitEnvelope::from).collect();
        let mut request = self.client.post(self.url.clone()).json(&envelopes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IngestError::Timeout
            } else {
                IngestError::Transient(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| IngestError::Other(format!("failed to parse ack response: {e}")))
    }
}

fn classify_status(status: StatusCode, body: &str) -> IngestError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => IngestError::RateLimited,
        StatusCode::REQUEST_TIMEOUT => IngestError::Timeout,
        status if status.is_server_error() => {
            IngestError::Transient(format!("ingestion API returned {status}"))
        }
        status => IngestError::Rejected(format!("ingestion API returned {status}: {body}")),
    }
}
