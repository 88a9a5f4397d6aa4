//! Orchestrator configuration loaded from TOML.
//!
//! Host provisioning (bridge, CNI conflist, containerd, kernel) is done by
//! deployment tooling; this file only names what that tooling produced.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default kernel boot arguments for runner VMs.
pub const DEFAULT_KERNEL_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub server: ServerConfig,
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub containerd: ContainerdConfig,
    #[serde(default)]
    pub cni: CniConfig,
    #[serde(default)]
    pub firecracker: FirecrackerConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

/// HTTP status API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: default_server_address() }
    }
}

/// Scope a runner is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    /// Instance-wide runners (admin token).
    InstanceType,
    /// Group runners (`group_id` required).
    GroupType,
    /// Project runners (`project_id` required).
    ProjectType,
}

impl RunnerType {
    /// Wire value used by the GitLab API.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstanceType => "instance_type",
            Self::GroupType => "group_type",
            Self::ProjectType => "project_type",
        }
    }
}

/// CI provider (GitLab) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabConfig {
    pub instance_url: String,
    /// Personal/group access token with the `create_runner` scope.
    #[serde(default)]
    pub access_token: String,
    /// Read the access token from this file when `access_token` is empty.
    #[serde(default)]
    pub access_token_file: Option<PathBuf>,
    #[serde(default = "default_runner_type")]
    pub runner_type: RunnerType,
    #[serde(default)]
    pub group_id: Option<u64>,
    #[serde(default)]
    pub project_id: Option<u64>,
}

/// containerd (image/snapshot engine) settings.
///
/// Images live in one namespace per pool, named after the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerdConfig {
    #[serde(default = "default_containerd_address")]
    pub address: PathBuf,
    #[serde(default = "default_snapshotter")]
    pub snapshotter: String,
    #[serde(default = "default_ctr_binary")]
    pub ctr_binary: PathBuf,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            address: default_containerd_address(),
            snapshotter: default_snapshotter(),
            ctr_binary: default_ctr_binary(),
        }
    }
}

/// CNI network the VMs attach to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniConfig {
    #[serde(default = "default_cni_conf_dir")]
    pub conf_dir: PathBuf,
    #[serde(default = "default_cni_bin_dir")]
    pub bin_dir: PathBuf,
    #[serde(default = "default_network_name")]
    pub network_name: String,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            conf_dir: default_cni_conf_dir(),
            bin_dir: default_cni_bin_dir(),
            network_name: default_network_name(),
        }
    }
}

/// Host-wide hypervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    /// `firecracker` binary; looked up in well-known locations when unset.
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    /// Root directory holding one sub-directory of sockets and logs per pool.
    #[serde(default = "default_pool_dir")]
    pub pool_dir: PathBuf,
    /// Kernel used by pools that do not name their own.
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self { binary_path: None, pool_dir: default_pool_dir(), kernel_path: None }
    }
}

/// One runner pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default = "default_min_runners")]
    pub min_runners: usize,
    #[serde(default = "default_max_runners")]
    pub max_runners: usize,
    pub runner: RunnerConfig,
    #[serde(default)]
    pub firecracker: VmSizing,
}

/// Runner registration policy of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub run_untagged: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default = "default_access_level")]
    pub access_level: String,
    /// Maximum job timeout in seconds.
    #[serde(default)]
    pub maximum_timeout: Option<u64>,
    /// Container image holding the runner root filesystem.
    pub image: String,
}

/// Per-pool VM sizing and boot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSizing {
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default = "default_mem_size_mib")]
    pub mem_size_mib: u32,
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u8,
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
    #[serde(default = "default_kernel_args")]
    pub kernel_args: String,
    /// Static metadata merged into every runner's guest document.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for VmSizing {
    fn default() -> Self {
        Self {
            binary_path: None,
            mem_size_mib: default_mem_size_mib(),
            vcpu_count: default_vcpu_count(),
            kernel_path: None,
            kernel_args: default_kernel_args(),
            metadata: serde_json::Map::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}
fn default_server_address() -> String {
    "0.0.0.0:8084".to_owned()
}
fn default_runner_type() -> RunnerType {
    RunnerType::GroupType
}
fn default_containerd_address() -> PathBuf {
    PathBuf::from("/run/containerd/containerd.sock")
}
fn default_snapshotter() -> String {
    "devmapper".to_owned()
}
fn default_ctr_binary() -> PathBuf {
    PathBuf::from("ctr")
}
fn default_cni_conf_dir() -> PathBuf {
    PathBuf::from("/etc/cni/net.d")
}
fn default_cni_bin_dir() -> PathBuf {
    PathBuf::from("/opt/cni/bin")
}
fn default_network_name() -> String {
    "firepool".to_owned()
}
fn default_pool_dir() -> PathBuf {
    PathBuf::from("/var/lib/firepool/pools")
}
fn default_min_runners() -> usize {
    1
}
fn default_max_runners() -> usize {
    10
}
fn default_access_level() -> String {
    "not_protected".to_owned()
}
fn default_mem_size_mib() -> u32 {
    2048
}
fn default_vcpu_count() -> u8 {
    2
}
fn default_kernel_args() -> String {
    DEFAULT_KERNEL_ARGS.to_owned()
}

impl Config {
    /// Load, expand, and validate a config file.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigRead`] if the file (or the access token
    /// file) cannot be read, [`CoreError::ConfigParse`] on malformed TOML,
    /// and [`CoreError::InvalidConfig`] when validation fails.
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| CoreError::ConfigRead { path: path.to_owned(), source })?;
        let mut config = Self::parse(&content)?;
        config.resolve_access_token()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from TOML after expanding environment references.
    ///
    /// Does not validate; call [`Config::validate`] afterwards.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigParse`] on malformed TOML.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let expanded = expand_env(s, |name| std::env::var(name).ok());
        Ok(toml::from_str(&expanded)?)
    }

    fn resolve_access_token(&mut self) -> Result<(), CoreError> {
        if !self.gitlab.access_token.is_empty() {
            return Ok(());
        }
        if let Some(path) = &self.gitlab.access_token_file {
            let token = std::fs::read_to_string(path)
                .map_err(|source| CoreError::ConfigRead { path: path.clone(), source })?;
            self.gitlab.access_token = token.trim().to_owned();
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.gitlab.instance_url.is_empty() {
            return Err(CoreError::invalid("gitlab.instance_url", "is required"));
        }
        if self.gitlab.access_token.is_empty() {
            return Err(CoreError::invalid(
                "gitlab.access_token",
                "access_token or access_token_file is required",
            ));
        }
        match self.gitlab.runner_type {
            RunnerType::InstanceType => {}
            RunnerType::GroupType if self.gitlab.group_id.is_none() => {
                return Err(CoreError::invalid("gitlab.group_id", "required for group_type runners"));
            }
            RunnerType::ProjectType if self.gitlab.project_id.is_none() => {
                return Err(CoreError::invalid(
                    "gitlab.project_id",
                    "required for project_type runners",
                ));
            }
            RunnerType::GroupType | RunnerType::ProjectType => {}
        }

        if self.pools.is_empty() {
            return Err(CoreError::invalid("pools", "at least one pool must be configured"));
        }

        let mut seen = HashSet::new();
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.name.is_empty() {
                return Err(CoreError::invalid(format!("pools[{i}].name"), "is required"));
            }
            // Used as a directory name, containerd namespace and netns prefix.
            if !pool.name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
                return Err(CoreError::invalid(
                    format!("pools[{i}].name"),
                    format!("'{}' may only contain ASCII letters, digits, '-' and '_'", pool.name),
                ));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(CoreError::invalid(
                    format!("pools[{i}].name"),
                    format!("duplicate pool name '{}'", pool.name),
                ));
            }
            if pool.runner.image.is_empty() {
                return Err(CoreError::invalid(format!("pools[{i}].runner.image"), "is required"));
            }
            if pool.min_runners > pool.max_runners {
                return Err(CoreError::invalid(
                    format!("pools[{i}].min_runners"),
                    "cannot be greater than max_runners",
                ));
            }
            if !matches!(pool.runner.access_level.as_str(), "not_protected" | "ref_protected") {
                return Err(CoreError::invalid(
                    format!("pools[{i}].runner.access_level"),
                    "must be 'not_protected' or 'ref_protected'",
                ));
            }
            if self.kernel_path_for(pool).is_none() {
                return Err(CoreError::invalid(
                    format!("pools[{i}].firecracker.kernel_path"),
                    "no kernel path for pool and no firecracker.kernel_path default",
                ));
            }
        }
        Ok(())
    }

    /// Kernel image for a pool: its own, else the host-wide default.
    #[must_use]
    pub fn kernel_path_for(&self, pool: &PoolConfig) -> Option<PathBuf> {
        pool.firecracker
            .kernel_path
            .clone()
            .or_else(|| self.firecracker.kernel_path.clone())
    }
}

/// Expand `${VAR}` and `$VAR` references; unknown variables expand to "".
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&(_, '{')) => {
                let start = i + 2;
                match input[start..].find('}') {
                    Some(len) => {
                        let name = &input[start..start + len];
                        out.push_str(&lookup(name).unwrap_or_default());
                        // Skip past the closing brace.
                        for (j, _) in chars.by_ref() {
                            if j == start + len {
                                break;
                            }
                        }
                    }
                    None => out.push(c),
                }
            }
            Some(&(_, n)) if n == '_' || n.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(&(_, n)) = chars.peek() {
                    if n == '_' || n.is_ascii_alphanumeric() {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name).unwrap_or_default());
            }
            _ => out.push(c),
        }
    }
    out
}
