//! Firecracker microVM lifecycle management for firepool runners.
//!
//! [`VmManager`] materializes a runner VM from a container image: it pulls
//! the image into the pool's namespace, leases and snapshots its layers,
//! boots Firecracker on the snapshot with CNI networking and a guest
//! metadata document, and tears all of it down again on destroy.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod cni;
pub mod config;
pub mod ctr;
pub mod error;
pub mod firecracker;
pub mod handle;
pub mod image;
pub mod manager;
pub mod mmds;
pub mod recovery;
mod unix_client;

pub use backend::{LaunchRequest, Machine, VmmBackend};
pub use cni::CniNetwork;
pub use config::{ManagerConfig, VmSpec};
pub use ctr::CtrEngine;
pub use error::ExecutorError;
pub use firecracker::FirecrackerBackend;
pub use handle::{ExitSignal, ExitState, ExitWatch, VmInfo};
pub use image::{Image, ImageEngine, Lease, Mount};
pub use manager::{VmLifecycle, VmManager};
pub use recovery::RecoveryReport;
