//! Guest metadata document shared by the host and the guest agent.
//!
//! The host writes this document into the hypervisor's metadata service
//! under `meta-data/<METADATA_NAMESPACE>`; the guest reads it back from the
//! link-local endpoint at boot.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Key of the runner document inside `meta-data`.
pub const METADATA_NAMESPACE: &str = "firepool";

/// Link-local address the hypervisor serves metadata on.
pub const METADATA_ADDRESS: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Historical metadata version published alongside `latest` for guest
/// clients that pin a dated path.
pub const METADATA_PINNED_VERSION: &str = "2009-04-04";

/// Runner configuration delivered to the guest.
///
/// Missing fields deserialize as empty so that validation can name the
/// field that is absent instead of failing with a generic parse error.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerMetadata {
    /// Base URL of the CI instance.
    pub instance_url: String,
    /// One-time runner authentication token.
    pub runner_token: String,
    /// Provider-side runner id.
    pub runner_id: u64,
    pub runner_name: String,
    /// Comma-separated runner tags.
    pub runner_tags: String,
    pub pool_name: String,
    /// Pool-local runner record id.
    pub vm_id: String,
    /// Machine id used by the provider to tell apart machines sharing one token.
    pub system_id: String,
}

impl RunnerMetadata {
    /// Returns the name of the first required field that is empty.
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.instance_url.is_empty() {
            Some("instance_url")
        } else if self.runner_token.is_empty() {
            Some("runner_token")
        } else if self.runner_name.is_empty() {
            Some("runner_name")
        } else {
            None
        }
    }
}

impl fmt::Debug for RunnerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerMetadata")
            .field("instance_url", &self.instance_url)
            .field("runner_token", &"<redacted>")
            .field("runner_id", &self.runner_id)
            .field("runner_name", &self.runner_name)
            .field("runner_tags", &self.runner_tags)
            .field("pool_name", &self.pool_name)
            .field("vm_id", &self.vm_id)
            .field("system_id", &self.system_id)
            .finish()
    }
}
