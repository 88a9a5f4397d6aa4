//! Core types for the firepool ephemeral CI runner orchestrator.
//!
//! Holds what every other crate agrees on: identifiers, runner records and
//! their lifecycle states, the guest metadata document, the metrics hook
//! trait, and the TOML configuration.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod id;
pub mod metadata;
pub mod metrics;
pub mod runner;

pub use config::{Config, GitLabConfig, PoolConfig, RunnerConfig, RunnerType, VmSizing};
pub use error::CoreError;
pub use id::{RunnerId, VmId};
pub use metadata::RunnerMetadata;
pub use metrics::{MetricsSink, NoopMetrics};
pub use runner::{PoolStatus, RunnerCounts, RunnerInfo, RunnerState, RunnerToken};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_state_terminal_split() {
        assert!(RunnerState::Stopped.is_terminal());
        assert!(RunnerState::Failed.is_terminal());
        assert!(!RunnerState::Stopping.is_terminal());
        assert!(!RunnerState::Busy.is_terminal());
    }

    #[test]
    fn runner_state_serializes_lowercase() {
        let s = match serde_json::to_string(&RunnerState::Stopping) {
            Ok(s) => s,
            Err(e) => panic!("serialize failed: {e}"),
        };
        assert_eq!(s, "\"stopping\"");
    }

    #[test]
    fn runner_token_never_displays() {
        let token = RunnerToken::new("glrt-very-secret");
        assert!(!format!("{token:?}").contains("glrt"));
        assert!(!token.to_string().contains("glrt"));
        assert_eq!(token.expose(), "glrt-very-secret");
    }

    #[test]
    fn runner_counts_tally_and_totals() {
        let counts = RunnerCounts::tally([
            RunnerState::Starting,
            RunnerState::Idle,
            RunnerState::Idle,
            RunnerState::Busy,
            RunnerState::Stopping,
            RunnerState::Stopped,
            RunnerState::Failed,
        ]);
        assert_eq!(counts.idle, 2);
        assert_eq!(counts.active(), 5);
        assert_eq!(counts.terminal(), 2);
        assert_eq!(counts.total(), 7);
    }

    #[test]
    fn runner_info_omits_absent_fields() {
        let info = RunnerInfo {
            id: RunnerId::from("default-abc".to_owned()),
            name: "firepool-default-0a1b2c3d".to_owned(),
            status: RunnerState::Starting,
            vm_id: None,
            ip_address: None,
            started_at: chrono::Utc::now(),
            provider_runner_id: None,
        };
        let json = match serde_json::to_value(&info) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {e}"),
        };
        assert!(json.get("vm_id").is_none());
        assert!(json.get("token").is_none());
        assert_eq!(json["status"], "starting");
    }
}
