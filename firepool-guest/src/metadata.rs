//! Client for the hypervisor's link-local metadata service.

use std::time::Duration;

use firepool_core::metadata::{METADATA_ADDRESS, METADATA_NAMESPACE};
use firepool_core::RunnerMetadata;
use tokio_util::sync::CancellationToken;

use crate::GuestError;

/// Per-request timeout of the metadata client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between fetch attempts while the guest boots.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Base URL of the metadata service inside the VM.
#[must_use]
pub fn default_metadata_url() -> String {
    format!("http://{METADATA_ADDRESS}")
}

/// Fetches the runner document from `<base>/latest/meta-data/<namespace>`.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    base_url: String,
    http: reqwest::Client,
}

impl MetadataClient {
    /// # Errors
    /// Returns [`GuestError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, GuestError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// # Errors
    /// Returns [`GuestError::Request`] if the HTTP client cannot be built.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GuestError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self { base_url, http })
    }

    fn document_url(&self) -> String {
        format!("{}/latest/meta-data/{METADATA_NAMESPACE}", self.base_url)
    }

    /// Fetch and validate the runner document once.
    ///
    /// # Errors
    /// Transport failures, non-200 answers, undecodable JSON, and documents
    /// missing the instance URL, token, or runner name.
    pub async fn get_metadata(&self) -> Result<RunnerMetadata, GuestError> {
        // The service answers in JSON only when asked to.
        let response = self
            .http
            .get(self.document_url())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(GuestError::Status { status: status.as_u16(), body });
        }

        let metadata: RunnerMetadata = serde_json::from_str(&body)?;
        if let Some(field) = metadata.missing_field() {
            return Err(GuestError::MissingField(field));
        }
        Ok(metadata)
    }

    /// Poll until a valid document arrives or `cancel` fires.
    ///
    /// The document may be attached shortly after the VM starts, so every
    /// failure is retried after `interval`.
    ///
    /// # Errors
    /// Only [`GuestError::Cancelled`].
    pub async fn wait_for_metadata(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunnerMetadata, GuestError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let fetched = tokio::select! {
                () = cancel.cancelled() => return Err(GuestError::Cancelled),
                fetched = self.get_metadata() => fetched,
            };
            match fetched {
                Ok(metadata) => {
                    tracing::debug!(attempt, "metadata available");
                    return Ok(metadata);
                }
                Err(e) => tracing::debug!(attempt, error = %e, "metadata not ready"),
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(GuestError::Cancelled),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}
