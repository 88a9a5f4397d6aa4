//! [`ImageEngine`] backed by containerd, driven through its `ctr` CLI.
//!
//! `ctr` cannot attach resources to a lease, so the engine remembers which
//! snapshots each lease prepared and removes them when the lease is
//! cancelled. The record lives in memory; leases left by a crashed process
//! are swept by the manager at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::process::Command;

use crate::image::{chain_id, Image, ImageEngine, Lease, Mount};
use crate::ExecutorError;

/// containerd image engine using the `ctr` binary.
#[derive(Debug)]
pub struct CtrEngine {
    binary: PathBuf,
    address: PathBuf,
    snapshotter: String,
    leased_snapshots: Mutex<HashMap<String, Vec<String>>>,
}

/// Failure of one `ctr` invocation.
#[derive(Debug)]
struct CtrFailure {
    stderr: String,
}

impl CtrFailure {
    fn is_not_found(&self) -> bool {
        self.stderr.contains("not found") || self.stderr.contains("does not exist")
    }
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Deserialize)]
struct ImageIndex {
    manifests: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct ImageManifest {
    config: Descriptor,
}

#[derive(Deserialize)]
struct ImageConfig {
    rootfs: RootFs,
}

#[derive(Deserialize)]
struct RootFs {
    diff_ids: Vec<String>,
}

impl CtrEngine {
    #[must_use]
    pub fn new(binary: PathBuf, address: PathBuf, snapshotter: impl Into<String>) -> Self {
        Self {
            binary,
            address,
            snapshotter: snapshotter.into(),
            leased_snapshots: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, namespace: Option<&str>, args: &[&str]) -> Result<Vec<u8>, CtrFailure> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--address").arg(&self.address);
        if let Some(ns) = namespace {
            cmd.arg("--namespace").arg(ns);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::trace!(?args, namespace, "ctr");
        let output = cmd.output().await.map_err(|e| CtrFailure {
            stderr: format!("exec {}: {e}", self.binary.display()),
        })?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(CtrFailure {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }

    async fn run_op(
        &self,
        operation: &'static str,
        namespace: &str,
        args: &[&str],
    ) -> Result<Vec<u8>, ExecutorError> {
        self.run(Some(namespace), args)
            .await
            .map_err(|f| ExecutorError::engine(operation, f.stderr))
    }

    async fn content<T: DeserializeOwned>(
        &self,
        namespace: &str,
        digest: &str,
    ) -> Result<T, ExecutorError> {
        let raw = self.run_op("content get", namespace, &["content", "get", digest]).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| ExecutorError::engine("content get", format!("decode {digest}: {e}")))
    }

    fn remember_snapshot(&self, lease: &str, key: &str) {
        self.leased_snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(lease.to_owned())
            .or_default()
            .push(key.to_owned());
    }

    fn forget_lease(&self, lease: &str) -> Vec<String> {
        self.leased_snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(lease)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImageEngine for CtrEngine {
    async fn health_check(&self) -> Result<(), ExecutorError> {
        self.run(None, &["version"])
            .await
            .map(|_| ())
            .map_err(|f| ExecutorError::EngineUnavailable(format!("{}: {}", self.address.display(), f.stderr)))
    }

    async fn get_image(&self, namespace: &str, reference: &str) -> Result<Option<Image>, ExecutorError> {
        let filter = format!("name=={reference}");
        let raw = self.run_op("images ls", namespace, &["images", "ls", &filter]).await?;
        Ok(parse_image_listing(&String::from_utf8_lossy(&raw), reference))
    }

    async fn pull(&self, namespace: &str, reference: &str) -> Result<Image, ExecutorError> {
        self.run_op(
            "images pull",
            namespace,
            &["images", "pull", "--snapshotter", &self.snapshotter, reference],
        )
        .await?;
        self.get_image(namespace, reference)
            .await?
            .ok_or_else(|| ExecutorError::engine("images pull", format!("{reference} missing after pull")))
    }

    async fn unpack(&self, namespace: &str, image: &Image) -> Result<(), ExecutorError> {
        // Content is local, so pulling again only unpacks.
        self.run_op(
            "unpack",
            namespace,
            &["images", "pull", "--snapshotter", &self.snapshotter, &image.name],
        )
        .await
        .map(|_| ())
    }

    async fn rootfs_chain_id(&self, namespace: &str, image: &Image) -> Result<String, ExecutorError> {
        let top: serde_json::Value = self.content(namespace, &image.digest).await?;
        let manifest_digest = if top.get("manifests").is_some() {
            let index: ImageIndex = serde_json::from_value(top)
                .map_err(|e| ExecutorError::engine("content get", format!("decode index: {e}")))?;
            select_manifest(&index.manifests, host_architecture())
                .ok_or_else(|| {
                    ExecutorError::engine(
                        "content get",
                        format!("{} has no linux/{} manifest", image.name, host_architecture()),
                    )
                })?
                .to_owned()
        } else {
            image.digest.clone()
        };

        let manifest: ImageManifest = self.content(namespace, &manifest_digest).await?;
        let config: ImageConfig = self.content(namespace, &manifest.config.digest).await?;
        chain_id(&config.rootfs.diff_ids)
            .ok_or_else(|| ExecutorError::engine("content get", format!("{} has no layers", image.name)))
    }

    async fn create_lease(&self, namespace: &str, id: &str) -> Result<Lease, ExecutorError> {
        self.run_op("leases create", namespace, &["leases", "create", "--id", id])
            .await?;
        Ok(Lease { id: id.to_owned(), namespace: namespace.to_owned() })
    }

    async fn cancel_lease(&self, lease: &Lease) -> Result<(), ExecutorError> {
        for key in self.forget_lease(&lease.id) {
            if let Err(e) = self.remove_snapshot(&lease.namespace, &key).await {
                tracing::warn!(snapshot = %key, error = %e, "failed to remove snapshot");
            }
        }
        match self.run(Some(&lease.namespace), &["leases", "delete", &lease.id]).await {
            Ok(_) => Ok(()),
            Err(f) if f.is_not_found() => Err(ExecutorError::LeaseNotFound(lease.id.clone())),
            Err(f) => Err(ExecutorError::engine("leases delete", f.stderr)),
        }
    }

    async fn list_leases(&self, namespace: &str, prefix: &str) -> Result<Vec<Lease>, ExecutorError> {
        let raw = self.run_op("leases ls", namespace, &["leases", "ls", "--quiet"]).await?;
        Ok(parse_lease_ids(&String::from_utf8_lossy(&raw), prefix)
            .map(|id| Lease { id: id.to_owned(), namespace: namespace.to_owned() })
            .collect())
    }

    async fn remove_snapshot(&self, namespace: &str, key: &str) -> Result<(), ExecutorError> {
        let args: [&str; 5] = ["snapshots", "--snapshotter", &self.snapshotter, "rm", key];
        match self.run(Some(namespace), &args).await {
            Ok(_) => Ok(()),
            Err(f) if f.is_not_found() => Ok(()),
            Err(f) => Err(ExecutorError::engine("snapshots rm", f.stderr)),
        }
    }

    async fn snapshot_exists(&self, namespace: &str, key: &str) -> Result<bool, ExecutorError> {
        let args: [&str; 5] = ["snapshots", "--snapshotter", &self.snapshotter, "info", key];
        match self.run(Some(namespace), &args).await {
            Ok(_) => Ok(true),
            Err(f) if f.is_not_found() => Ok(false),
            Err(f) => Err(ExecutorError::engine("snapshots info", f.stderr)),
        }
    }

    async fn prepare_snapshot(&self, lease: &Lease, key: &str, parent: &str) -> Result<(), ExecutorError> {
        self.run_op(
            "snapshots prepare",
            &lease.namespace,
            &["snapshots", "--snapshotter", &self.snapshotter, "prepare", key, parent],
        )
        .await?;
        self.remember_snapshot(&lease.id, key);
        Ok(())
    }

    async fn snapshot_mounts(&self, namespace: &str, key: &str) -> Result<Vec<Mount>, ExecutorError> {
        let raw = self
            .run_op(
                "snapshots mounts",
                namespace,
                &["snapshots", "--snapshotter", &self.snapshotter, "mounts", "/", key],
            )
            .await?;
        Ok(parse_mount_commands(&String::from_utf8_lossy(&raw)))
    }
}

/// Digest of the first `images ls` row whose reference matches.
fn parse_image_listing(listing: &str, reference: &str) -> Option<Image> {
    listing.lines().skip(1).find_map(|line| {
        let mut cols = line.split_whitespace();
        let name = cols.next()?;
        let _media_type = cols.next()?;
        let digest = cols.next()?;
        (name == reference).then(|| Image { name: name.to_owned(), digest: digest.to_owned() })
    })
}

/// Ids from `leases ls --quiet` that start with `prefix`.
fn parse_lease_ids<'a>(listing: &'a str, prefix: &'a str) -> impl Iterator<Item = &'a str> {
    listing.lines().map(str::trim).filter(move |id| !id.is_empty() && id.starts_with(prefix))
}

/// Parse `mount -t <type> <source> <target> [-o <opts>]` lines.
fn parse_mount_commands(output: &str) -> Vec<Mount> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.first() != Some(&"mount") {
                return None;
            }
            let mut kind = String::new();
            let mut options = Vec::new();
            let mut positional = Vec::new();
            let mut i = 1;
            while i < tokens.len() {
                match tokens[i] {
                    "-t" => {
                        kind = tokens.get(i + 1).copied().unwrap_or_default().to_owned();
                        i += 2;
                    }
                    "-o" => {
                        if let Some(opts) = tokens.get(i + 1) {
                            options = opts.split(',').map(str::to_owned).collect();
                        }
                        i += 2;
                    }
                    other => {
                        positional.push(other);
                        i += 1;
                    }
                }
            }
            let source = (*positional.first()?).to_owned();
            Some(Mount { kind, source, options })
        })
        .collect()
}

fn select_manifest<'a>(manifests: &'a [Descriptor], arch: &str) -> Option<&'a str> {
    manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|m| m.digest.as_str())
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
