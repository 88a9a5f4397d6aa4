//! Identifier generation for runners and VMs.
//!
//! Identifiers are random hex strings that always contain at least one
//! letter, so they can never be mistaken for a numeric id when they end up
//! in file names, netns names, or provider descriptions.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of random bytes in a full identifier (24 hex chars).
pub const ID_BYTES: usize = 12;

/// Number of random bytes in a short identifier (8 hex chars).
pub const SHORT_ID_BYTES: usize = 4;

/// Prefix used for generated runner display names.
pub const RUNNER_NAME_PREFIX: &str = "firepool";

/// Returns a new 24-character hex identifier.
#[must_use]
pub fn new_id() -> String {
    random_hex(ID_BYTES)
}

/// Returns a new 8-character hex identifier.
#[must_use]
pub fn short_id() -> String {
    random_hex(SHORT_ID_BYTES)
}

/// Runner display name: `firepool-{pool}-{short}`.
#[must_use]
pub fn runner_name(pool: &str) -> String {
    format!("{RUNNER_NAME_PREFIX}-{pool}-{}", short_id())
}

/// System id used by the CI provider to tell apart machines that share one
/// authentication token: `s_{id}`.
#[must_use]
pub fn system_id() -> String {
    format!("s_{}", new_id())
}

fn random_hex(len: usize) -> String {
    loop {
        let mut out = String::with_capacity(len * 2);
        while out.len() < len * 2 {
            // Skip the version/variant bytes (6 and 8) of the v4 layout.
            let bytes = Uuid::new_v4().into_bytes();
            for byte in bytes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != 6 && *i != 8)
                .map(|(_, b)| b)
            {
                if out.len() == len * 2 {
                    break;
                }
                out.push_str(&format!("{byte:02x}"));
            }
        }
        if !out.bytes().all(|b| b.is_ascii_digit()) {
            return out;
        }
    }
}

/// Pool-local identifier of a runner record: `{pool}-{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerId(pub String);

impl RunnerId {
    /// Generates a fresh runner id for the given pool.
    #[must_use]
    pub fn generate(pool: &str) -> Self {
        Self(format!("{pool}-{}", new_id()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Globally unique identifier of a running VM.
///
/// Derived from the caller's logical id plus a random suffix, so two VMs
/// booted for the same runner id never collide on sockets or leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub String);

impl VmId {
    /// Derives a unique VM id from a logical id.
    #[must_use]
    pub fn derive(logical: &str) -> Self {
        Self(format!("{logical}-{}", new_id()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VmId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
