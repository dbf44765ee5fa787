//! Task orchestration
//!
//! Composes host expansion, credential resolution, the SSH client and
//! the worker pool into one batch run: validate, expand, resolve, fan
//! out, stream per-host results, aggregate, and enforce the whole-task
//! deadline.

mod pool;

pub use crate::ssh::TaskOp;
pub use pool::{HostResult, HostStatus};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, AuthOptions, BastionOptions, Resolver};
use crate::expand::{self, ExpandError};
use crate::ssh::{ExecOptions, HostKeyPolicy, SessionExecutor, SshClient, SudoPromptFilter};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid host pattern: {0}")]
    Pattern(#[from] ExpandError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Exit status for the CLI caller. Everything that fails before
    /// fan-out is a configuration-class error.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Batch run settings, as handed over by the flag/config layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Host patterns from the command line.
    pub hosts: Vec<String>,
    /// Additional patterns, one per line; blank lines ignored.
    pub hosts_file: Option<PathBuf>,
    /// Print the expanded host list and stop before connecting.
    pub list_only: bool,
    /// Default SSH port for targets without an explicit `:port`.
    pub port: u16,
    /// Worker pool size; clamped to at least 1.
    pub concurrency: usize,
    /// Bound on TCP connect plus SSH handshake, per host.
    pub connect_timeout_secs: u64,
    /// Bound on each session operation; 0 leaves it unbounded.
    pub command_timeout_secs: u64,
    /// Bound on the whole batch; 0 leaves it unbounded.
    pub task_timeout_secs: u64,
    pub auth: AuthOptions,
    pub bastion: Option<BastionOptions>,
    /// Value for `LANG`/`LC_ALL`/`LANGUAGE` on the remote side.
    pub lang: Option<String>,
    pub sudo: bool,
    /// User commands run as when `sudo` is set.
    pub run_as: String,
    pub host_key_policy: HostKeyPolicy,
    /// Regex alternatives for sudo prompt stripping; the default list
    /// covers the English and Simplified Chinese prompts.
    pub sudo_prompt_templates: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            hosts_file: None,
            list_only: false,
            port: 22,
            concurrency: 1,
            connect_timeout_secs: 10,
            command_timeout_secs: 0,
            task_timeout_secs: 0,
            auth: AuthOptions::default(),
            bastion: None,
            lang: None,
            sudo: false,
            run_as: "root".to_string(),
            host_key_policy: HostKeyPolicy::default(),
            sudo_prompt_templates: SudoPromptFilter::default_templates(),
        }
    }
}

/// Aggregated outcome of one batch run.
#[derive(Debug)]
pub struct TaskReport {
    pub task_id: String,
    /// Per-host results, in completion order.
    pub details: Vec<HostResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub elapsed: Duration,
    /// The whole-task deadline fired and remaining hosts were abandoned.
    pub timed_out: bool,
    /// Set instead of running anything when `list_only` was requested.
    pub listed_hosts: Option<Vec<String>>,
}

impl TaskReport {
    fn new(task_id: String) -> Self {
        Self {
            task_id,
            details: Vec::new(),
            success_count: 0,
            failure_count: 0,
            elapsed: Duration::ZERO,
            timed_out: false,
            listed_hosts: None,
        }
    }

    fn listed(task_id: String, hosts: Vec<String>) -> Self {
        Self {
            listed_hosts: Some(hosts),
            ..Self::new(task_id)
        }
    }

    /// Exit status for the CLI caller: 0 all hosts succeeded, 1 any host
    /// failed, 3 whole-task timeout.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            3
        } else if self.failure_count > 0 {
            1
        } else {
            0
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// One batch task: a [`TaskOp`] plus its run settings.
pub struct Task {
    id: String,
    op: TaskOp,
    config: TaskConfig,
}

impl Task {
    pub fn new(op: TaskOp, config: TaskConfig) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        Self { id, op, config }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Expand command-line patterns plus the hosts file into the working
    /// host list (deduplicated, first-seen order).
    pub fn target_hosts(&self) -> Result<Vec<String>, TaskError> {
        let mut patterns: Vec<String> = self
            .config
            .hosts
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();

        if let Some(file) = &self.config.hosts_file {
            let content = std::fs::read_to_string(file).map_err(|e| {
                TaskError::Config(format!("read hosts file '{}' failed: {e}", file.display()))
            })?;
            patterns.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }

        if patterns.is_empty() {
            return Err(TaskError::Config(
                "no target hosts; provide host patterns or a hosts file".to_string(),
            ));
        }

        Ok(expand::expand_all(&patterns)?)
    }

    fn validate(&self) -> Result<(), TaskError> {
        match &self.op {
            TaskOp::Command { command } => {
                if command.trim().is_empty() {
                    return Err(TaskError::Config("command must not be empty".to_string()));
                }
            }
            TaskOp::Script { local_path, .. } => {
                if !local_path.is_file() {
                    return Err(TaskError::Config(format!(
                        "script '{}' not found",
                        local_path.display()
                    )));
                }
            }
            TaskOp::Push {
                files, zip_files, ..
            } => {
                if files.is_empty() && zip_files.is_empty() {
                    return Err(TaskError::Config("no files to push".to_string()));
                }
                for f in files.iter().chain(zip_files) {
                    if !f.exists() {
                        return Err(TaskError::Config(format!(
                            "local path '{}' not found",
                            f.display()
                        )));
                    }
                }
            }
            TaskOp::Fetch {
                files, dest_dir, ..
            } => {
                if files.is_empty() {
                    return Err(TaskError::Config("no files to fetch".to_string()));
                }
                if dest_dir.as_os_str().is_empty() {
                    return Err(TaskError::Config(
                        "fetch needs a destination directory".to_string(),
                    ));
                }
                std::fs::create_dir_all(dest_dir)?;
            }
        }
        Ok(())
    }

    /// Run the batch. Errors returned here happened before fan-out
    /// (exit code 2); per-host failures are inside the report.
    pub async fn run(self) -> Result<TaskReport, TaskError> {
        let started = Instant::now();

        let hosts = self.target_hosts()?;
        debug!(task_id = %self.id, count = hosts.len(), "expanded target hosts");

        if self.config.list_only {
            return Ok(TaskReport::listed(self.id, hosts));
        }

        self.validate()?;

        let resolver = Resolver::new(
            self.config.auth.clone(),
            self.config.bastion.clone(),
            self.config.sudo,
        );
        let (auth, bastion) = resolver.resolve().await?;

        info!(
            task_id = %self.id,
            user = %auth.user,
            hosts = hosts.len(),
            concurrency = self.config.concurrency.max(1),
            "starting task"
        );
        if self.config.sudo {
            debug!(run_as = %self.config.run_as, "sudo enabled");
        }

        let mut client = SshClient::new(auth)
            .with_port(self.config.port)
            .with_connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .with_command_timeout(timeout_opt(self.config.command_timeout_secs))
            .with_host_key_policy(self.config.host_key_policy);
        if let Some(bastion) = bastion {
            client = client.with_bastion(bastion);
        }

        let executor = Arc::new(SessionExecutor::new(
            Arc::new(client),
            self.op.clone(),
            ExecOptions {
                lang: self.config.lang.clone(),
                sudo: self.config.sudo,
                run_as: self.config.run_as.clone(),
            },
            SudoPromptFilter::new(&self.config.sudo_prompt_templates),
        ));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut results = pool::spawn_batch(
            hosts.clone(),
            self.config.concurrency,
            cancel_rx,
            move |host| {
                let executor = executor.clone();
                async move { executor.run(&host).await }
            },
        );

        let mut report = TaskReport::new(self.id.clone());

        let timed_out = match timeout_opt(self.config.task_timeout_secs) {
            Some(deadline) => {
                tokio::time::timeout(deadline, drain(&mut results, hosts.len(), &mut report))
                    .await
                    .is_err()
            }
            None => {
                drain(&mut results, hosts.len(), &mut report).await;
                false
            }
        };

        if timed_out {
            warn!(
                task_id = %self.id,
                timeout_secs = self.config.task_timeout_secs,
                "task timed out, abandoning remaining hosts"
            );
            let _ = cancel_tx.send(true);
            report.timed_out = true;
        }

        report.elapsed = started.elapsed();
        info!(
            task_id = %self.id,
            success = report.success_count,
            failure = report.failure_count,
            elapsed_secs = format!("{:.2}", report.elapsed_secs()),
            "task finished"
        );

        Ok(report)
    }
}

async fn drain(rx: &mut mpsc::Receiver<HostResult>, expected: usize, report: &mut TaskReport) {
    let mut received = 0;
    while received < expected {
        match rx.recv().await {
            Some(result) => {
                match result.status {
                    HostStatus::Success => {
                        report.success_count += 1;
                        info!(
                            host = %result.host,
                            status = %result.status,
                            output = %result.message,
                            "host finished"
                        );
                    }
                    HostStatus::Failure => {
                        report.failure_count += 1;
                        error!(
                            host = %result.host,
                            status = %result.status,
                            output = %result.message,
                            "host failed"
                        );
                    }
                }
                report.details.push(result);
                received += 1;
            }
            None => break,
        }
    }
}

fn timeout_opt(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn command_task(config: TaskConfig) -> Task {
        Task::new(
            TaskOp::Command {
                command: "uptime".to_string(),
            },
            config,
        )
    }

    #[test]
    fn hosts_merge_arguments_and_file_with_dedup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.[1-2]").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  10.0.0.1  ").unwrap();

        let task = command_task(TaskConfig {
            hosts: vec!["web[1-2]".to_string()],
            hosts_file: Some(file.path().to_path_buf()),
            ..Default::default()
        });

        assert_eq!(
            task.target_hosts().unwrap(),
            vec!["web1", "web2", "10.0.0.1", "10.0.0.2"]
        );
    }

    #[test]
    fn no_hosts_is_a_config_error() {
        let task = command_task(TaskConfig::default());
        assert!(matches!(task.target_hosts(), Err(TaskError::Config(_))));
    }

    #[test]
    fn bad_pattern_is_a_pattern_error() {
        let task = command_task(TaskConfig {
            hosts: vec!["web[5-1]".to_string()],
            ..Default::default()
        });
        assert!(matches!(task.target_hosts(), Err(TaskError::Pattern(_))));
    }

    #[test]
    fn empty_command_fails_validation() {
        let task = Task::new(
            TaskOp::Command {
                command: "  ".to_string(),
            },
            TaskConfig::default(),
        );
        assert!(matches!(task.validate(), Err(TaskError::Config(_))));
    }

    #[test]
    fn missing_script_fails_validation() {
        let task = Task::new(
            TaskOp::Script {
                local_path: PathBuf::from("/nonexistent/sshfleet-test.sh"),
                dest_dir: "/tmp".to_string(),
                remove_after: false,
                overwrite: false,
            },
            TaskConfig::default(),
        );
        assert!(matches!(task.validate(), Err(TaskError::Config(_))));
    }

    #[test]
    fn push_without_files_fails_validation() {
        let task = Task::new(
            TaskOp::Push {
                files: Vec::new(),
                zip_files: Vec::new(),
                dest_dir: "/tmp".to_string(),
                overwrite: false,
            },
            TaskConfig::default(),
        );
        assert!(matches!(task.validate(), Err(TaskError::Config(_))));
    }

    #[test]
    fn fetch_creates_the_destination_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("collected");

        let task = Task::new(
            TaskOp::Fetch {
                files: vec!["/etc/hostname".to_string()],
                dest_dir: dest.clone(),
                tmp_dir: "/tmp".to_string(),
            },
            TaskConfig::default(),
        );
        task.validate().unwrap();
        assert!(dest.is_dir());
    }

    #[tokio::test]
    async fn list_only_returns_hosts_without_connecting() {
        let task = command_task(TaskConfig {
            hosts: vec!["app[01-03]".to_string()],
            list_only: true,
            ..Default::default()
        });

        let report = task.run().await.unwrap();
        assert_eq!(
            report.listed_hosts.as_deref().unwrap(),
            ["app01", "app02", "app03"]
        );
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_hosts_become_failure_results() {
        // Port 1 on loopback is not listening; password auth avoids any
        // interactive prompting during resolution.
        let task = command_task(TaskConfig {
            hosts: vec!["127.0.0.1:1".to_string()],
            concurrency: 2,
            connect_timeout_secs: 2,
            auth: crate::auth::AuthOptions {
                user: Some("tester".to_string()),
                password: Some("pw".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let report = task.run().await.unwrap();
        assert_eq!(report.details.len(), 1);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.success_count, 0);
        assert_eq!(report.details[0].status, HostStatus::Failure);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn task_deadline_abandons_hung_hosts() {
        // A listener that never speaks SSH keeps the handshake pending
        // until the connect timeout, so the task deadline fires first.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let task = command_task(TaskConfig {
            hosts: vec![format!("127.0.0.1:{}", addr.port())],
            connect_timeout_secs: 30,
            task_timeout_secs: 1,
            auth: crate::auth::AuthOptions {
                user: Some("tester".to_string()),
                password: Some("pw".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let report = task.run().await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.exit_code(), 3);
        assert!(report.details.is_empty());
    }

    #[test]
    fn exit_codes_map_report_states() {
        let mut report = TaskReport::new("t".to_string());
        assert_eq!(report.exit_code(), 0);
        report.failure_count = 1;
        assert_eq!(report.exit_code(), 1);
        report.timed_out = true;
        assert_eq!(report.exit_code(), 3);

        let err = TaskError::Config("x".to_string());
        assert_eq!(err.exit_code(), 2);
    }
}
