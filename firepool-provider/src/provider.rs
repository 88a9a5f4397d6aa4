//! The provider seam the pool controller is written against.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{CreatedRunner, RunnerOptions};
use crate::{GitLabClient, ProviderError};

/// Mints and revokes runner identities with a CI system.
#[async_trait]
pub trait RunnerProvider: Send + Sync {
    /// Base URL the guest runner connects to.
    fn instance_url(&self) -> &str;

    /// Register a runner and obtain its one-time token.
    ///
    /// # Errors
    /// Provider specific; the caller marks the runner failed.
    async fn create_runner(
        &self,
        description: &str,
        tags: &[String],
        options: &RunnerOptions,
    ) -> Result<CreatedRunner, ProviderError>;

    /// Revoke a runner identity.
    ///
    /// # Errors
    /// Provider specific; ephemeral runners may already be gone.
    async fn delete_runner(&self, runner_id: u64) -> Result<(), ProviderError>;

    /// Whether the runner is executing a job right now.
    ///
    /// # Errors
    /// Provider specific; the caller leaves the runner state unchanged.
    async fn is_runner_busy(&self, runner_id: u64) -> Result<bool, ProviderError>;
}

#[async_trait]
impl RunnerProvider for GitLabClient {
    fn instance_url(&self) -> &str {
        GitLabClient::instance_url(self)
    }

    async fn create_runner(
        &self,
        description: &str,
        tags: &[String],
        options: &RunnerOptions,
    ) -> Result<CreatedRunner, ProviderError> {
        GitLabClient::create_runner(self, description, tags, options).await
    }

    async fn delete_runner(&self, runner_id: u64) -> Result<(), ProviderError> {
        GitLabClient::delete_runner(self, runner_id).await
    }

    async fn is_runner_busy(&self, runner_id: u64) -> Result<bool, ProviderError> {
        Ok(!self.running_jobs(runner_id).await?.is_empty())
    }
}

#[async_trait]
impl<T: RunnerProvider + ?Sized> RunnerProvider for Arc<T> {
    fn instance_url(&self) -> &str {
        (**self).instance_url()
    }

    async fn create_runner(
        &self,
        description: &str,
        tags: &[String],
        options: &RunnerOptions,
    ) -> Result<CreatedRunner, ProviderError> {
        (**self).create_runner(description, tags, options).await
    }

    async fn delete_runner(&self, runner_id: u64) -> Result<(), ProviderError> {
        (**self).delete_runner(runner_id).await
    }

    async fn is_runner_busy(&self, runner_id: u64) -> Result<bool, ProviderError> {
        (**self).is_runner_busy(runner_id).await
    }
}
