//! Guest side of firepool: runs inside each runner VM.
//!
//! [`MetadataClient`] reads the runner identity from the link-local
//! metadata service; [`RunnerAgent`] hands it to `gitlab-runner run-single`.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

mod account;
pub mod agent;
pub mod error;
pub mod metadata;

pub use account::{GROUP_FILE, PASSWD_FILE};
pub use agent::{RunnerAgent, DEFAULT_GROUP, DEFAULT_OWNER};
pub use error::GuestError;
pub use metadata::{default_metadata_url, MetadataClient, DEFAULT_RETRY_INTERVAL};
