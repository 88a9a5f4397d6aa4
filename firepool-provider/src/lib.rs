//! GitLab runner registration for firepool.
//!
//! [`GitLabClient`] wraps the runner management endpoints of the GitLab
//! REST API. The pool controller only sees the [`RunnerProvider`] trait.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod client;
pub mod error;
pub mod provider;
pub mod types;

pub use client::{GitLabClient, DEFAULT_TIMEOUT};
pub use error::ProviderError;
pub use provider::RunnerProvider;
pub use types::{CreatedRunner, Job, Runner, RunnerDetails, RunnerGroup, RunnerOptions, RunnerProject};
