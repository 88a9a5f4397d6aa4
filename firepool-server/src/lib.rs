//! Pool controller and status API for the firepool runner orchestrator.
//!
//! Each [`Pool`] keeps its warm-runner floor by minting one-time CI runner
//! identities and booting a Firecracker VM per identity. [`Server`] owns the
//! configured pools and exposes their state over HTTP.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod metrics;
pub mod pool;
pub mod routes;
pub mod server;

pub use error::ServerError;
pub use metrics::PrometheusRecorder;
pub use pool::{ManagedPool, Pool, PoolSettings};
pub use server::Server;
