//! Per-host session execution
//!
//! One [`SessionExecutor`] is shared by every worker of a task: it dials
//! the host, runs the task operation (command, script, push or fetch) on
//! top of the session and its SFTP subsystem, and closes the connection.
//! Steps within a host are strictly sequential.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use russh::client::Handle;
use russh::ChannelMsg;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::{split_host_port, ClientHandler, DialedHost, SshClient};
use super::error::SshError;
use super::sftp;

/// The four task kinds, dispatched over one shared connect/auth/session
/// lifecycle.
#[derive(Debug, Clone)]
pub enum TaskOp {
    /// Run a remote command.
    Command { command: String },
    /// Upload a local script, mark it executable, run it, optionally
    /// delete it afterwards.
    Script {
        local_path: PathBuf,
        dest_dir: String,
        remove_after: bool,
        overwrite: bool,
    },
    /// Push local files/directories (and pre-built zip bundles, unpacked
    /// remotely) under `dest_dir`.
    Push {
        files: Vec<PathBuf>,
        zip_files: Vec<PathBuf>,
        dest_dir: String,
        overwrite: bool,
    },
    /// Fetch remote files/directories into `dest_dir/<host>/`.
    Fetch {
        files: Vec<String>,
        dest_dir: PathBuf,
        tmp_dir: String,
    },
}

/// Execution environment shared by all operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    /// Value exported as `LANG`, `LC_ALL` and `LANGUAGE` before the
    /// command runs.
    pub lang: Option<String>,
    /// Wrap commands in sudo and feed the login password on stdin.
    pub sudo: bool,
    /// User to sudo as.
    pub run_as: String,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            lang: None,
            sudo: false,
            run_as: "root".to_string(),
        }
    }
}

const LINUX_USER_PATTERN: &str = "[a-zA-Z0-9_.-]+[$]?";

/// Strips sudo password prompts from captured output.
///
/// The locale set is a configuration list; the default covers the
/// English and Simplified Chinese prompts only. Prompts from other
/// locales leak into the captured output.
pub struct SudoPromptFilter {
    re: Option<Regex>,
}

impl SudoPromptFilter {
    /// Build from a list of regex alternatives, each matched anchored at
    /// line start. An invalid alternative disables stripping with a
    /// warning rather than failing the task.
    pub fn new(templates: &[String]) -> Self {
        if templates.is_empty() {
            return Self { re: None };
        }

        let pattern = format!("(?m)^(?:{})", templates.join("|"));
        match Regex::new(&pattern) {
            Ok(re) => Self { re: Some(re) },
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid sudo prompt pattern, stripping disabled");
                Self { re: None }
            }
        }
    }

    pub fn default_templates() -> Vec<String> {
        vec![
            format!(r"\[sudo\] password for {LINUX_USER_PATTERN}: "),
            format!(r"\[sudo\] {LINUX_USER_PATTERN} 的密码："),
        ]
    }

    pub fn strip(&self, s: &str) -> String {
        match &self.re {
            Some(re) => re.replace_all(s, "").into_owned(),
            None => s.to_string(),
        }
    }
}

impl Default for SudoPromptFilter {
    fn default() -> Self {
        Self::new(&Self::default_templates())
    }
}

/// Runs one task operation per host over a fresh connection.
pub struct SessionExecutor {
    client: Arc<SshClient>,
    op: TaskOp,
    opts: ExecOptions,
    filter: SudoPromptFilter,
}

impl SessionExecutor {
    pub fn new(
        client: Arc<SshClient>,
        op: TaskOp,
        opts: ExecOptions,
        filter: SudoPromptFilter,
    ) -> Self {
        Self {
            client,
            op,
            opts,
            filter,
        }
    }

    /// Dial `target` (`host[:port]`), run the operation, close the
    /// connection. Returns the captured output or status message.
    pub async fn run(&self, target: &str) -> Result<String, SshError> {
        let (host, port) = split_host_port(target, self.client.port());

        let dialed = self.client.dial(&host, port).await?;
        debug!(host = %host, port = port, "session opened");

        let result = self.run_op(&dialed, &host).await;
        dialed.close().await;
        result
    }

    async fn run_op(&self, dialed: &DialedHost, host: &str) -> Result<String, SshError> {
        match &self.op {
            TaskOp::Command { command } => self.exec_command(&dialed.handle, command).await,
            TaskOp::Script {
                local_path,
                dest_dir,
                remove_after,
                overwrite,
            } => {
                self.run_script(&dialed.handle, local_path, dest_dir, *remove_after, *overwrite)
                    .await
            }
            TaskOp::Push {
                files,
                zip_files,
                dest_dir,
                overwrite,
            } => {
                self.run_push(&dialed.handle, files, zip_files, dest_dir, *overwrite)
                    .await
            }
            TaskOp::Fetch {
                files,
                dest_dir,
                tmp_dir,
            } => self.run_fetch(&dialed.handle, host, files, dest_dir, tmp_dir).await,
        }
    }

    /// Execute a command, stdout and stderr merged. Success iff the
    /// remote exit status is 0.
    async fn exec_command(
        &self,
        handle: &Handle<ClientHandler>,
        command: &str,
    ) -> Result<String, SshError> {
        let full = self.wrap_command(command);
        debug!(command = %full, "executing");

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(format!("open session: {e}")))?;

        let op = async {
            channel
                .exec(true, full.as_str())
                .await
                .map_err(|e| SshError::Channel(format!("exec: {e}")))?;

            if self.opts.sudo {
                // The remote may or may not prompt (NOPASSWD sudoers);
                // `sudo -S` reads the line from stdin only when it needs it.
                let line = format!("{}\n", self.client.password().as_str());
                channel
                    .data(line.as_bytes())
                    .await
                    .map_err(|e| SshError::Channel(format!("write stdin: {e}")))?;
            }

            let mut output = Vec::new();
            let mut status: Option<u32> = None;
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { ref data }) => output.extend_from_slice(data),
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        output.extend_from_slice(data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                    None => break,
                    _ => {}
                }
            }
            Ok::<_, SshError>((output, status))
        };

        let (output, status) = match self.client.command_timeout() {
            Some(d) => tokio::time::timeout(d, op)
                .await
                .map_err(|_| SshError::Timeout("running remote command".to_string()))??,
            None => op.await?,
        };

        let text = self.clean_output(&output);
        match status {
            Some(0) => Ok(text),
            Some(code) => Err(SshError::RemoteExec {
                status: code,
                output: text,
            }),
            None => Err(SshError::Channel(
                "command exited without status".to_string(),
            )),
        }
    }

    async fn run_script(
        &self,
        handle: &Handle<ClientHandler>,
        local_path: &Path,
        dest_dir: &str,
        remove_after: bool,
        overwrite: bool,
    ) -> Result<String, SshError> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                SshError::Transfer(format!(
                    "script path '{}' has no file name",
                    local_path.display()
                ))
            })?;

        let dest_dir = if dest_dir.is_empty() { "/tmp" } else { dest_dir };
        let remote_path = sftp::join_remote(dest_dir, file_name);

        let sftp = sftp::open_sftp(handle).await?;
        if !overwrite && sftp::exists(&sftp, &remote_path).await {
            return Err(SshError::TargetExists(remote_path));
        }

        sftp::upload_file(
            &sftp,
            local_path,
            &remote_path,
            Some(0o755),
            self.client.command_timeout(),
        )
        .await?;

        let result = self.exec_command(handle, &remote_path).await;

        if remove_after {
            // Delete regardless of the exit status above.
            if let Err(e) = sftp.remove_file(&remote_path).await {
                warn!(remote = %remote_path, error = %e, "failed to remove uploaded script");
            }
        }

        result
    }

    /// Push files and directories. Directory trees are recreated with
    /// their file mode bits; file symlinks are followed, directory
    /// symlinks are not recursed. Zip bundles are transferred and
    /// unpacked remotely.
    async fn run_push(
        &self,
        handle: &Handle<ClientHandler>,
        files: &[PathBuf],
        zip_files: &[PathBuf],
        dest_dir: &str,
        overwrite: bool,
    ) -> Result<String, SshError> {
        let sftp = sftp::open_sftp(handle).await?;
        sftp::mkdir_all(&sftp, dest_dir).await?;
        let timeout = self.client.command_timeout();

        let mut count = 0usize;
        for local in files {
            let name = file_name_of(local)?;
            let remote = sftp::join_remote(dest_dir, &name);
            if !overwrite && sftp::exists(&sftp, &remote).await {
                return Err(SshError::TargetExists(remote));
            }
            sftp::upload_path(&sftp, local, &remote, timeout).await?;
            count += 1;
        }

        for zip in zip_files {
            let name = file_name_of(zip)?;
            let remote = sftp::join_remote(dest_dir, &name);
            if !overwrite && sftp::exists(&sftp, &remote).await {
                return Err(SshError::TargetExists(remote));
            }
            sftp::upload_file(&sftp, zip, &remote, None, timeout).await?;
            let unpack = format!(
                "cd {} && unzip -o -q {} && rm -f {}",
                shell_escape(dest_dir),
                shell_escape(&name),
                shell_escape(&name)
            );
            self.exec_command(handle, &unpack).await?;
            count += 1;
        }

        Ok(format!("pushed {count} item(s) to {dest_dir}"))
    }

    /// Fetch remote paths into `dest_dir/<host>/`. With sudo the sources
    /// are first copied into a staging directory under `tmp_dir` as the
    /// run-as user with read permissions widened, so SFTP (running as the
    /// login user) can read them; the staging copy is removed afterwards.
    async fn run_fetch(
        &self,
        handle: &Handle<ClientHandler>,
        host: &str,
        files: &[String],
        dest_dir: &Path,
        tmp_dir: &str,
    ) -> Result<String, SshError> {
        let local_root = dest_dir.join(host);
        tokio::fs::create_dir_all(&local_root).await?;

        let sftp = sftp::open_sftp(handle).await?;
        let timeout = self.client.command_timeout();
        let mut fetched = 0usize;

        if self.opts.sudo {
            let tmp_dir = if tmp_dir.is_empty() { "/tmp" } else { tmp_dir };
            let token = uuid::Uuid::new_v4().simple().to_string();
            let staging = sftp::join_remote(tmp_dir, &format!("fetch-{}", &token[..8]));

            let mut stage_cmd = format!("mkdir -p {}", shell_escape(&staging));
            for remote in files {
                stage_cmd.push_str(&format!(
                    " && cp -r {} {}",
                    shell_escape(remote),
                    shell_escape(&staging)
                ));
            }
            stage_cmd.push_str(&format!(" && chmod -R a+rX {}", shell_escape(&staging)));
            self.exec_command(handle, &stage_cmd).await?;

            let downloads = async {
                for remote in files {
                    let name = remote_base_name(remote);
                    sftp::download_path(
                        &sftp,
                        &sftp::join_remote(&staging, name),
                        &local_root.join(name),
                        timeout,
                    )
                    .await?;
                    fetched += 1;
                }
                Ok::<_, SshError>(())
            }
            .await;

            // Remove the staging copy whether or not the download worked.
            let cleanup = format!("rm -rf {}", shell_escape(&staging));
            if let Err(e) = self.exec_command(handle, &cleanup).await {
                warn!(host = %host, staging = %staging, error = %e, "failed to remove staging copy");
            }

            downloads?;
        } else {
            for remote in files {
                let name = remote_base_name(remote);
                sftp::download_path(&sftp, remote, &local_root.join(name), timeout).await?;
                fetched += 1;
            }
        }

        Ok(format!(
            "fetched {fetched} item(s) into {}",
            local_root.display()
        ))
    }

    /// Prefix the locale exports, then wrap in sudo when requested.
    fn wrap_command(&self, command: &str) -> String {
        let command = match &self.opts.lang {
            Some(lang) if !lang.is_empty() => format!(
                "export LANG={lang};export LC_ALL={lang};export LANGUAGE={lang};{command}"
            ),
            _ => command.to_string(),
        };

        if self.opts.sudo {
            format!(
                "sudo -H -u {} -p \"[sudo] password for {}: \" -S sh -c {}",
                self.opts.run_as,
                self.client.user(),
                shell_escape(&command)
            )
        } else {
            command
        }
    }

    /// Normalize line endings, strip sudo prompts, trim.
    fn clean_output(&self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw).replace("\r\n", "\n");
        self.filter.strip(text.trim()).trim().to_string()
    }
}

fn file_name_of(path: &Path) -> Result<String, SshError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| SshError::Transfer(format!("path '{}' has no file name", path.display())))
}

fn remote_base_name(remote: &str) -> &str {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or(remote)
}

fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
