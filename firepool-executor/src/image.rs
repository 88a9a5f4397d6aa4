//! Container image and snapshot engine abstraction.
//!
//! The manager materializes each VM's root filesystem as a copy-on-write
//! snapshot of an image's layer chain, protected by a lease for as long as
//! the VM runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ExecutorError;

/// An image present in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Reference the image is stored under.
    pub name: String,
    /// Digest of the manifest or index the reference points at.
    pub digest: String,
}

/// A reference that keeps layers and snapshots alive against garbage
/// collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub namespace: String,
}

/// One mount of a prepared snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    /// For block snapshotters, the device backing the snapshot.
    pub source: String,
    pub options: Vec<String>,
}

/// Image and snapshot operations, one namespace per pool.
///
/// Callers serialize pull, lease, and snapshot calls; implementations need
/// not guard against concurrent pulls of the same reference.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Check the engine endpoint is reachable.
    ///
    /// # Errors
    /// Returns [`ExecutorError::EngineUnavailable`] when it is not.
    async fn health_check(&self) -> Result<(), ExecutorError>;

    /// Look up an image; `Ok(None)` when it is not in the namespace.
    async fn get_image(&self, namespace: &str, reference: &str) -> Result<Option<Image>, ExecutorError>;

    /// Pull and unpack an image into the namespace.
    async fn pull(&self, namespace: &str, reference: &str) -> Result<Image, ExecutorError>;

    /// Unpack an already-present image for the configured snapshotter.
    async fn unpack(&self, namespace: &str, image: &Image) -> Result<(), ExecutorError>;

    /// Chain id of the image's root filesystem layers.
    async fn rootfs_chain_id(&self, namespace: &str, image: &Image) -> Result<String, ExecutorError>;

    async fn create_lease(&self, namespace: &str, id: &str) -> Result<Lease, ExecutorError>;

    /// Release a lease and everything it holds.
    ///
    /// # Errors
    /// Returns [`ExecutorError::LeaseNotFound`] if it was already released.
    async fn cancel_lease(&self, lease: &Lease) -> Result<(), ExecutorError>;

    /// Leases in `namespace` whose id starts with `prefix`.
    async fn list_leases(&self, namespace: &str, prefix: &str) -> Result<Vec<Lease>, ExecutorError>;

    async fn snapshot_exists(&self, namespace: &str, key: &str) -> Result<bool, ExecutorError>;

    /// Remove a snapshot. A missing snapshot is not an error.
    async fn remove_snapshot(&self, namespace: &str, key: &str) -> Result<(), ExecutorError>;

    /// Prepare a writable snapshot `key` on top of `parent`, held by `lease`.
    async fn prepare_snapshot(&self, lease: &Lease, key: &str, parent: &str) -> Result<(), ExecutorError>;

    async fn snapshot_mounts(&self, namespace: &str, key: &str) -> Result<Vec<Mount>, ExecutorError>;

    /// Release client-side resources. Called once when the manager closes.
    async fn close(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// OCI chain id of an ordered list of layer diff ids.
///
/// `chain(1) = diff(1)`, `chain(n) = sha256(chain(n-1) + " " + diff(n))`.
/// Returns `None` for an image without layers.
#[must_use]
pub fn chain_id<S: AsRef<str>>(diff_ids: &[S]) -> Option<String> {
    let mut iter = diff_ids.iter();
    let mut chain = iter.next()?.as_ref().to_owned();
    for diff in iter {
        let mut hasher = Sha256::new();
        hasher.update(chain.as_bytes());
        hasher.update(b" ");
        hasher.update(diff.as_ref().as_bytes());
        chain = format!("sha256:{}", hex(&hasher.finalize()));
    }
    Some(chain)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
