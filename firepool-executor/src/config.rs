//! VM specification and manager configuration types.

use std::path::PathBuf;
use std::time::Duration;

use firepool_core::config::DEFAULT_KERNEL_ARGS;
use serde::{Deserialize, Serialize};

/// Everything needed to create one runner VM. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmSpec {
    /// Logical id; the manager suffixes it to derive the unique VM id.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Owning pool. Also the image engine namespace and working sub-directory.
    pub pool: String,

    /// Memory size in mebibytes.
    pub mem_size_mib: u32,

    /// Number of virtual CPUs to allocate.
    pub vcpu_count: u8,

    /// Path to the Linux kernel image.
    pub kernel_path: PathBuf,

    /// Kernel boot arguments.
    pub kernel_args: String,

    /// Container image reference providing the root filesystem.
    pub image: String,

    pub labels: Vec<String>,

    /// Document served to the guest through the metadata service.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl VmSpec {
    /// Create a spec with default sizing and no metadata.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        pool: impl Into<String>,
        kernel_path: PathBuf,
        image: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            pool: pool.into(),
            mem_size_mib: 2048,
            vcpu_count: 2,
            kernel_path,
            kernel_args: DEFAULT_KERNEL_ARGS.to_owned(),
            image: image.into(),
            labels: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_sizing(mut self, mem_size_mib: u32, vcpu_count: u8) -> Self {
        self.mem_size_mib = mem_size_mib;
        self.vcpu_count = vcpu_count;
        self
    }

    #[must_use]
    pub fn with_kernel_args(mut self, kernel_args: impl Into<String>) -> Self {
        self.kernel_args = kernel_args.into();
        self
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Settings of a [`VmManager`](crate::VmManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root holding one sub-directory of sockets and logs per pool.
    pub pool_root: PathBuf,

    /// Lease ids are `<lease_prefix>/pools/<pool>/<vm id>`.
    pub lease_prefix: String,

    /// How long destroy waits for the hypervisor to exit after asking it to
    /// stop, before killing it.
    pub stop_grace: Duration,

    /// Upper bound on releasing a lease during destroy.
    pub lease_timeout: Duration,
}

impl ManagerConfig {
    #[must_use]
    pub fn new(pool_root: PathBuf) -> Self {
        Self {
            pool_root,
            lease_prefix: "firepool".to_owned(),
            stop_grace: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(5),
        }
    }

    /// Working directory of a pool.
    #[must_use]
    pub fn pool_dir(&self, pool: &str) -> PathBuf {
        self.pool_root.join(pool)
    }

    /// Lease id protecting one VM's layers.
    #[must_use]
    pub fn lease_id(&self, pool: &str, vm_id: &str) -> String {
        format!("{}/pools/{pool}/{vm_id}", self.lease_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_id_is_scoped_to_pool_and_vm() {
        let cfg = ManagerConfig::new(PathBuf::from("/var/lib/firepool/pools"));
        assert_eq!(cfg.lease_id("default", "r-1-abc"), "firepool/pools/default/r-1-abc");
        assert_eq!(cfg.pool_dir("default"), PathBuf::from("/var/lib/firepool/pools/default"));
    }

    #[test]
    fn spec_builder_defaults() {
        let spec = VmSpec::new("r-1", "default", PathBuf::from("/k"), "img:latest")
            .with_sizing(512, 1);
        assert_eq!(spec.name, "r-1");
        assert_eq!(spec.mem_size_mib, 512);
        assert_eq!(spec.kernel_args, DEFAULT_KERNEL_ARGS);
        assert!(spec.metadata.is_empty());
    }
}
