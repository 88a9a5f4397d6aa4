//! Runs `gitlab-runner run-single` for exactly one job inside the VM.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use firepool_core::RunnerMetadata;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::account::{self, Account, GROUP_FILE, PASSWD_FILE};
use crate::GuestError;

pub const DEFAULT_GITLAB_RUNNER: &str = "/usr/local/bin/gitlab-runner";
pub const DEFAULT_WORK_DIR: &str = "/opt/gitlab-runner";
pub const DEFAULT_EXECUTOR: &str = "shell";
/// Unprivileged account of the stock runner image.
pub const DEFAULT_OWNER: &str = "runner";
pub const DEFAULT_GROUP: &str = "docker";
const DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Drives the runner binary for a single job.
///
/// Registration already happened on the host, so `run-single` receives
/// everything on its command line and no local config file is written.
/// With an owner set, the runner drops to that account and the work
/// directory is handed over to it.
#[derive(Debug, Clone)]
pub struct RunnerAgent {
    gitlab_runner: PathBuf,
    work_dir: PathBuf,
    executor: String,
    owner: Option<String>,
    group: Option<String>,
    passwd_file: PathBuf,
    group_file: PathBuf,
}

impl Default for RunnerAgent {
    fn default() -> Self {
        Self {
            gitlab_runner: PathBuf::from(DEFAULT_GITLAB_RUNNER),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            executor: DEFAULT_EXECUTOR.to_owned(),
            owner: None,
            group: None,
            passwd_file: PathBuf::from(PASSWD_FILE),
            group_file: PathBuf::from(GROUP_FILE),
        }
    }
}

impl RunnerAgent {
    #[must_use]
    pub fn with_gitlab_runner(mut self, path: impl Into<PathBuf>) -> Self {
        self.gitlab_runner = path.into();
        self
    }

    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Executor type passed to the runner (`shell`, `docker`, ...).
    #[must_use]
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    /// Run the job as this user instead of the agent's own.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Group override; defaults to the owner's primary group. Ignored
    /// without an owner.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_account_files(mut self, passwd: impl Into<PathBuf>, group: impl Into<PathBuf>) -> Self {
        self.passwd_file = passwd.into();
        self.group_file = group.into();
        self
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Command line of the runner. Contains the token; never log it.
    fn run_single_args(&self, metadata: &RunnerMetadata) -> Vec<String> {
        let mut args = vec![
            "run-single".to_owned(),
            "--url".to_owned(),
            metadata.instance_url.clone(),
            "--token".to_owned(),
            metadata.runner_token.clone(),
            "--executor".to_owned(),
            self.executor.clone(),
            "--builds-dir".to_owned(),
            self.work_dir.join("builds").display().to_string(),
            "--cache-dir".to_owned(),
            self.work_dir.join("cache").display().to_string(),
        ];
        if !metadata.runner_name.is_empty() {
            args.push("--name".to_owned());
            args.push(metadata.runner_name.clone());
        }
        args
    }

    fn drop_privileges(&self, command: &mut Command, account: &Account) -> Result<(), GuestError> {
        std::os::unix::fs::chown(&self.work_dir, Some(account.uid), Some(account.gid))?;
        let home = account.home.as_deref().unwrap_or(&self.work_dir);
        command.uid(account.uid).gid(account.gid).env("HOME", home).env("USER", &account.name);
        tracing::debug!(user = %account.name, uid = account.uid, gid = account.gid, "running gitlab-runner unprivileged");
        Ok(())
    }

    fn search_path() -> String {
        let path = std::env::var("PATH").unwrap_or_default();
        if path.is_empty() {
            "/usr/local/bin:/usr/bin:/bin".to_owned()
        } else if path.split(':').any(|p| p == "/usr/local/bin") {
            path
        } else {
            format!("/usr/local/bin:{path}")
        }
    }

    /// Run one job and return when the runner exits.
    ///
    /// Cancellation kills the runner and counts as success; the host tears
    /// the VM down either way.
    ///
    /// # Errors
    /// [`GuestError::UnknownUser`]/[`GuestError::UnknownGroup`] if the
    /// owner cannot be resolved, [`GuestError::Spawn`] if the binary cannot
    /// start, [`GuestError::RunnerFailed`] for a non-zero exit.
    pub async fn run_once(&self, metadata: &RunnerMetadata, cancel: &CancellationToken) -> Result<(), GuestError> {
        let account = match &self.owner {
            Some(owner) => {
                Some(account::resolve(&self.passwd_file, &self.group_file, owner, self.group.as_deref()).await?)
            }
            None => None,
        };

        tokio::fs::create_dir_all(&self.work_dir).await?;

        let mut command = Command::new(&self.gitlab_runner);
        command
            .args(self.run_single_args(metadata))
            .current_dir(&self.work_dir)
            .env("PATH", Self::search_path())
            .env("DOCKER_HOST", DOCKER_HOST)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(account) = &account {
            self.drop_privileges(&mut command, account)?;
        }

        let mut child =
            command.spawn().map_err(|source| GuestError::Spawn { path: self.gitlab_runner.clone(), source })?;

        tracing::info!(
            pid = child.id(),
            runner_name = %metadata.runner_name,
            executor = %self.executor,
            user = account.as_ref().map(|a| a.name.as_str()),
            "gitlab-runner started (single-job mode)"
        );

        let status: ExitStatus = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                tracing::info!("gitlab-runner stopped due to shutdown signal");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to signal gitlab-runner");
                }
                let _ = child.wait().await;
                return Ok(());
            }
        };

        if status.success() {
            tracing::info!("gitlab-runner completed job and exited");
            Ok(())
        } else {
            tracing::warn!(exit_code = ?status.code(), "gitlab-runner exited with error");
            Err(GuestError::RunnerFailed { code: status.code() })
        }
    }
}
