//! GitLab runner API request and response shapes.

use chrono::{DateTime, Utc};
use firepool_core::{RunnerConfig, RunnerToken};
use serde::{Deserialize, Serialize};

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

/// Optional knobs for runner registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerOptions {
    pub run_untagged: bool,
    pub locked: bool,
    /// `not_protected` or `ref_protected`.
    pub access_level: Option<String>,
    /// Maximum job duration in seconds.
    pub maximum_timeout: Option<u64>,
    pub paused: bool,
    /// Free text shown to GitLab admins, at most 1024 characters.
    pub maintenance_note: Option<String>,
}

impl From<&RunnerConfig> for RunnerOptions {
    fn from(runner: &RunnerConfig) -> Self {
        Self {
            run_untagged: runner.run_untagged,
            locked: runner.locked,
            access_level: (!runner.access_level.is_empty()).then(|| runner.access_level.clone()),
            maximum_timeout: runner.maximum_timeout,
            paused: false,
            maintenance_note: None,
        }
    }
}

/// Body of `POST /api/v4/user/runners`.
///
/// Empty and false fields are omitted so GitLab applies its defaults.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateRunnerRequest<'a> {
    pub runner_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<u64>,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub description: &'a str,
    #[serde(skip_serializing_if = "is_false")]
    pub paused: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub locked: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub run_untagged: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag_list: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_level: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_note: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateRunnerResponse {
    pub id: u64,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// A freshly registered runner.
///
/// The token is returned exactly once by GitLab.
#[derive(Debug, Clone)]
pub struct CreatedRunner {
    pub id: u64,
    pub token: RunnerToken,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// A runner as listed by `GET /api/v4/runners`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Runner {
    pub id: u64,
    pub description: String,
    pub ip_address: Option<String>,
    pub active: bool,
    pub paused: bool,
    pub is_shared: bool,
    pub runner_type: String,
    pub name: Option<String>,
    pub online: Option<bool>,
    /// `online`, `offline`, `stale`, or `never_contacted`.
    pub status: String,
    pub tag_list: Vec<String>,
    pub run_untagged: bool,
    pub locked: bool,
    pub maximum_timeout: Option<u64>,
    pub access_level: Option<String>,
    pub version: Option<String>,
    pub revision: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub contacted_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerProject {
    pub id: u64,
    pub name: String,
    pub name_with_namespace: String,
    pub path: String,
    pub path_with_namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerGroup {
    pub id: u64,
    pub name: String,
    pub path: String,
}

/// `GET /api/v4/runners/:id`: the runner plus where it is assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerDetails {
    #[serde(flatten)]
    pub runner: Runner,
    #[serde(default)]
    pub projects: Vec<RunnerProject>,
    #[serde(default)]
    pub groups: Vec<RunnerGroup>,
}

/// A CI job as listed by `GET /api/v4/runners/:id/jobs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: u64,
    pub status: String,
    pub stage: String,
    pub name: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub tag_list: Vec<String>,
}

/// GitLab error document; `message` may be a string or a field map.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ErrorResponse {
    pub message: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ErrorResponse {
    pub(crate) fn describe(&self) -> Option<String> {
        let message = match &self.message {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let text = format!("{message}{}", self.error.as_deref().unwrap_or_default());
        (!text.is_empty()).then_some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_omits_defaults() {
        let req = CreateRunnerRequest {
            runner_type: "group_type",
            group_id: Some(7),
            project_id: None,
            description: "firepool-default-abc",
            paused: false,
            locked: false,
            run_untagged: true,
            tag_list: "linux,firecracker".to_owned(),
            access_level: Some("not_protected"),
            maximum_timeout: None,
            maintenance_note: None,
        };
        let value = serde_json::to_value(&req).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "runner_type": "group_type",
                "group_id": 7,
                "description": "firepool-default-abc",
                "run_untagged": true,
                "tag_list": "linux,firecracker",
                "access_level": "not_protected",
            })
        );
    }

    #[test]
    fn runner_details_flatten_runner_fields() {
        let details: RunnerDetails = serde_json::from_str(
            r#"{
                "id": 42,
                "description": "firepool-default-abc",
                "status": "online",
                "online": true,
                "paused": false,
                "runner_type": "group_type",
                "tag_list": ["linux"],
                "contacted_at": "2026-03-01T12:00:00.000Z",
                "groups": [{"id": 7, "name": "ci", "path": "ci"}]
            }"#,
        )
        .expect("parse");
        assert_eq!(details.runner.id, 42);
        assert_eq!(details.runner.online, Some(true));
        assert_eq!(details.runner.tag_list, vec!["linux".to_owned()]);
        assert!(details.runner.contacted_at.is_some());
        assert_eq!(details.groups.len(), 1);
        assert!(details.projects.is_empty());
    }

    #[test]
    fn job_ref_field_is_renamed() {
        let job: Job = serde_json::from_str(r#"{"id": 9, "status": "running", "ref": "main"}"#).expect("parse");
        assert_eq!(job.git_ref, "main");
        assert_eq!(job.status, "running");
    }

    #[test]
    fn error_response_handles_field_maps() {
        let plain: ErrorResponse = serde_json::from_str(r#"{"message": "403 Forbidden"}"#).expect("parse");
        assert_eq!(plain.describe().as_deref(), Some("403 Forbidden"));

        let fields: ErrorResponse =
            serde_json::from_str(r#"{"message": {"group_id": ["is missing"]}}"#).expect("parse");
        assert!(fields.describe().expect("message").contains("is missing"));

        let empty: ErrorResponse = serde_json::from_str("{}").expect("parse");
        assert_eq!(empty.describe(), None);
    }

    #[test]
    fn options_follow_pool_runner_config() {
        let runner = RunnerConfig {
            tags: vec!["linux".to_owned()],
            run_untagged: true,
            locked: true,
            access_level: "ref_protected".to_owned(),
            maximum_timeout: Some(3600),
            image: "runner:latest".to_owned(),
        };
        let options = RunnerOptions::from(&runner);
        assert!(options.run_untagged);
        assert!(options.locked);
        assert_eq!(options.access_level.as_deref(), Some("ref_protected"));
        assert_eq!(options.maximum_timeout, Some(3600));
        assert!(!options.paused);
    }
}
