//! HTTP client for the GitLab runner management API.

use std::fmt;
use std::time::Duration;

use firepool_core::{GitLabConfig, RunnerToken, RunnerType};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::types::{
    CreateRunnerRequest, CreateRunnerResponse, CreatedRunner, ErrorResponse, Job, Runner, RunnerDetails,
    RunnerOptions,
};
use crate::ProviderError;

/// Per-request timeout applied when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const TOKEN_HEADER: &str = "PRIVATE-TOKEN";

/// Stateless GitLab runner API client.
///
/// The registration scope (instance, group, or project) is fixed at
/// construction; every call is a single request bounded by the client timeout.
#[derive(Clone)]
pub struct GitLabClient {
    instance_url: String,
    access_token: String,
    runner_type: RunnerType,
    group_id: Option<u64>,
    project_id: Option<u64>,
    http: reqwest::Client,
}

impl fmt::Debug for GitLabClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitLabClient")
            .field("instance_url", &self.instance_url)
            .field("runner_type", &self.runner_type)
            .field("group_id", &self.group_id)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl GitLabClient {
    /// Build a client with the default timeout.
    ///
    /// # Errors
    /// Returns [`ProviderError::InvalidConfig`] if the URL or access token is
    /// empty, or the HTTP client cannot be built.
    pub fn new(config: &GitLabConfig) -> Result<Self, ProviderError> {
        Self::with_timeout(config, DEFAULT_TIMEOUT)
    }

    /// Build a client whose requests time out after `timeout`.
    ///
    /// # Errors
    /// Same as [`GitLabClient::new`].
    pub fn with_timeout(config: &GitLabConfig, timeout: Duration) -> Result<Self, ProviderError> {
        if config.instance_url.is_empty() {
            return Err(ProviderError::InvalidConfig("instance URL is required".to_owned()));
        }
        if config.access_token.is_empty() {
            return Err(ProviderError::InvalidConfig("access token is required".to_owned()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            instance_url: config.instance_url.trim_end_matches('/').to_owned(),
            access_token: config.access_token.clone(),
            runner_type: config.runner_type,
            group_id: config.group_id,
            project_id: config.project_id,
            http,
        })
    }

    /// Base URL with any trailing slash removed.
    #[must_use]
    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    #[must_use]
    pub fn runner_type(&self) -> RunnerType {
        self.runner_type
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v4{path}", self.instance_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(TOKEN_HEADER, &self.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn execute(
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String), ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|source| ProviderError::Request { operation, source })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ProviderError::Request { operation, source })?;
        Ok((status, body))
    }

    /// Register a runner and return its id and one-time token.
    ///
    /// `POST /api/v4/user/runners`. Tags are sent comma-joined.
    ///
    /// # Errors
    /// Any status other than 200/201 is an error, and so is a response
    /// without a token, since the token cannot be retrieved again.
    pub async fn create_runner(
        &self,
        description: &str,
        tags: &[String],
        options: &RunnerOptions,
    ) -> Result<CreatedRunner, ProviderError> {
        const OP: &str = "create runner";

        let body = CreateRunnerRequest {
            runner_type: self.runner_type.as_str(),
            group_id: match self.runner_type {
                RunnerType::GroupType => self.group_id,
                _ => None,
            },
            project_id: match self.runner_type {
                RunnerType::ProjectType => self.project_id,
                _ => None,
            },
            description,
            paused: options.paused,
            locked: options.locked,
            run_untagged: options.run_untagged,
            tag_list: tags.join(","),
            access_level: options.access_level.as_deref(),
            maximum_timeout: options.maximum_timeout,
            maintenance_note: options.maintenance_note.as_deref(),
        };

        tracing::debug!(
            runner_type = self.runner_type.as_str(),
            description,
            tags = ?tags,
            "creating runner via GitLab API"
        );

        let request = self.authorized(self.http.post(self.endpoint("/user/runners"))).json(&body);
        let (status, text) = Self::execute(OP, request).await?;
        if status != StatusCode::CREATED && status != StatusCode::OK {
            return Err(unexpected(OP, status, text));
        }

        let response: CreateRunnerResponse = decode(OP, &text)?;
        if response.token.is_empty() {
            return Err(ProviderError::EmptyToken);
        }
        if let Some(expires_at) = response.token_expires_at {
            tracing::debug!(provider_runner_id = response.id, %expires_at, "runner token expires");
        }
        tracing::info!(provider_runner_id = response.id, "created runner in GitLab");

        Ok(CreatedRunner {
            id: response.id,
            token: RunnerToken::new(response.token),
            token_expires_at: response.token_expires_at,
        })
    }

    /// `DELETE /api/v4/runners/:id`.
    ///
    /// # Errors
    /// Any status other than 204/200.
    pub async fn delete_runner(&self, runner_id: u64) -> Result<(), ProviderError> {
        const OP: &str = "delete runner";
        tracing::debug!(provider_runner_id = runner_id, "deleting runner from GitLab");

        let request = self.authorized(self.http.delete(self.endpoint(&format!("/runners/{runner_id}"))));
        let (status, body) = Self::execute(OP, request).await?;
        if status != StatusCode::NO_CONTENT && status != StatusCode::OK {
            return Err(ProviderError::Status { operation: OP, status: status.as_u16(), body });
        }

        tracing::info!(provider_runner_id = runner_id, "runner deleted from GitLab");
        Ok(())
    }

    /// `DELETE /api/v4/runners` with the runner's own token in the body.
    ///
    /// The runner token authenticates the call; the access token is not sent.
    ///
    /// # Errors
    /// Any status other than 204/200.
    pub async fn delete_runner_by_token(&self, token: &RunnerToken) -> Result<(), ProviderError> {
        const OP: &str = "delete runner by token";
        tracing::debug!("deleting runner by token from GitLab");

        let request = self
            .http
            .delete(self.endpoint("/runners"))
            .json(&serde_json::json!({ "token": token.expose() }));
        let (status, body) = Self::execute(OP, request).await?;
        if status != StatusCode::NO_CONTENT && status != StatusCode::OK {
            return Err(ProviderError::Status { operation: OP, status: status.as_u16(), body });
        }

        tracing::info!("runner deleted from GitLab by token");
        Ok(())
    }

    /// `GET /api/v4/runners/:id`.
    ///
    /// # Errors
    /// Any status other than 200, or an undecodable body.
    pub async fn get_runner(&self, runner_id: u64) -> Result<RunnerDetails, ProviderError> {
        const OP: &str = "get runner";
        let request = self.authorized(self.http.get(self.endpoint(&format!("/runners/{runner_id}"))));
        self.get_json(OP, request).await
    }

    /// `GET /api/v4/runners`: every runner the access token can see.
    ///
    /// # Errors
    /// Any status other than 200, or an undecodable body.
    pub async fn list_runners(&self) -> Result<Vec<Runner>, ProviderError> {
        const OP: &str = "list runners";
        let request = self.authorized(self.http.get(self.endpoint("/runners")));
        let runners: Vec<Runner> = self.get_json(OP, request).await?;
        tracing::debug!(runner_count = runners.len(), "listed runners from GitLab");
        Ok(runners)
    }

    /// `GET /api/v4/runners/:id/jobs?status=running`.
    ///
    /// # Errors
    /// Any status other than 200, or an undecodable body.
    pub async fn running_jobs(&self, runner_id: u64) -> Result<Vec<Job>, ProviderError> {
        const OP: &str = "list runner jobs";
        let request = self
            .authorized(self.http.get(self.endpoint(&format!("/runners/{runner_id}/jobs"))))
            .query(&[("status", "running")]);
        self.get_json(OP, request).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let (status, body) = Self::execute(operation, request).await?;
        if status != StatusCode::OK {
            return Err(ProviderError::Status { operation, status: status.as_u16(), body });
        }
        decode(operation, &body)
    }
}

fn decode<T: DeserializeOwned>(operation: &'static str, body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|source| ProviderError::Decode { operation, source })
}

/// Prefer GitLab's structured error message, fall back to the raw body.
fn unexpected(operation: &'static str, status: StatusCode, body: String) -> ProviderError {
    let described = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(|e| e.describe());
    match described {
        Some(message) => ProviderError::Api { operation, status: status.as_u16(), message },
        None => ProviderError::Status { operation, status: status.as_u16(), body },
    }
}
