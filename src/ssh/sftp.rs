//! SFTP transfer helpers
//!
//! Thin recursive upload/download primitives on top of `russh-sftp`,
//! shared by the script, push and fetch operations. Remote paths always
//! use `/`; file mode bits are preserved on unix.

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::client::ClientHandler;
use super::error::SshError;

/// Open the SFTP subsystem on a fresh session channel.
pub(crate) async fn open_sftp(handle: &Handle<ClientHandler>) -> Result<SftpSession, SshError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SshError::Channel(format!("open sftp channel: {e}")))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| SshError::Channel(format!("request sftp subsystem: {e}")))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| SshError::Transfer(format!("start sftp session: {e}")))
}

pub(crate) async fn exists(sftp: &SftpSession, path: &str) -> bool {
    sftp.metadata(path).await.is_ok()
}

/// Join remote path components with `/` regardless of the local OS.
pub(crate) fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Create every missing component of a remote directory path.
pub(crate) async fn mkdir_all(sftp: &SftpSession, path: &str) -> Result<(), SshError> {
    let mut current = String::new();

    for component in path.split('/').filter(|c| !c.is_empty()) {
        if current.is_empty() && path.starts_with('/') {
            current = format!("/{component}");
        } else {
            current = join_remote(&current, component);
        }
        if !exists(sftp, &current).await {
            sftp.create_dir(&current)
                .await
                .map_err(|e| SshError::Transfer(format!("mkdir {current}: {e}")))?;
        }
    }

    Ok(())
}

/// Upload one local file, then apply `mode` when given (otherwise the
/// local mode bits are carried over on unix).
pub(crate) async fn upload_file(
    sftp: &SftpSession,
    local: &Path,
    remote: &str,
    mode: Option<u32>,
    op_timeout: Option<Duration>,
) -> Result<(), SshError> {
    let transfer = async {
        let contents = tokio::fs::read(local).await?;

        let mut file = sftp
            .open_with_flags(
                remote,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| SshError::Transfer(format!("open {remote}: {e}")))?;
        file.write_all(&contents).await?;
        file.flush().await?;
        file.shutdown().await?;

        debug!(local = %local.display(), remote = %remote, bytes = contents.len(), "uploaded file");
        Ok(())
    };
    with_timeout(op_timeout, remote, transfer).await?;

    let mode = mode.or_else(|| local_mode(local));
    if let Some(mode) = mode {
        set_permissions(sftp, remote, mode).await?;
    }

    Ok(())
}

pub(crate) async fn set_permissions(
    sftp: &SftpSession,
    remote: &str,
    mode: u32,
) -> Result<(), SshError> {
    let attrs = FileAttributes {
        permissions: Some(mode),
        ..Default::default()
    };
    sftp.set_metadata(remote, attrs)
        .await
        .map_err(|e| SshError::Transfer(format!("chmod {remote}: {e}")))
}

/// Upload a file or directory tree under `remote`, recreating relative
/// paths and carrying file mode bits.
pub(crate) async fn upload_path(
    sftp: &SftpSession,
    local: &Path,
    remote: &str,
    op_timeout: Option<Duration>,
) -> Result<(), SshError> {
    // std metadata follows symlinks, so a link to a file uploads content.
    let meta = tokio::fs::metadata(local).await?;
    if meta.is_dir() {
        mkdir_all(sftp, remote).await?;
        upload_dir_recursive(sftp, local, remote, op_timeout).await
    } else {
        upload_file(sftp, local, remote, None, op_timeout).await
    }
}

fn upload_dir_recursive<'a>(
    sftp: &'a SftpSession,
    local: &'a Path,
    remote: &'a str,
    op_timeout: Option<Duration>,
) -> Pin<Box<dyn std::future::Future<Output = Result<(), SshError>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(local).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let remote_path = join_remote(remote, &name);

            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                // Dangling symlink; nothing to transfer.
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            if meta.is_dir() {
                if entry.file_type().await?.is_symlink() {
                    // Directory symlinks are not followed to keep the walk finite.
                    debug!(path = %path.display(), "skipping directory symlink");
                    continue;
                }
                if !exists(sftp, &remote_path).await {
                    sftp.create_dir(&remote_path)
                        .await
                        .map_err(|e| SshError::Transfer(format!("mkdir {remote_path}: {e}")))?;
                }
                if let Some(mode) = local_mode(&path) {
                    set_permissions(sftp, &remote_path, mode).await?;
                }
                upload_dir_recursive(sftp, &path, &remote_path, op_timeout).await?;
            } else {
                upload_file(sftp, &path, &remote_path, None, op_timeout).await?;
            }
        }

        Ok(())
    })
}

/// Download a remote file or directory tree into `local`.
pub(crate) async fn download_path(
    sftp: &SftpSession,
    remote: &str,
    local: &Path,
    op_timeout: Option<Duration>,
) -> Result<(), SshError> {
    let meta = sftp
        .metadata(remote)
        .await
        .map_err(|e| SshError::Transfer(format!("stat {remote}: {e}")))?;

    if meta.is_dir() {
        tokio::fs::create_dir_all(local).await?;
        download_dir_recursive(sftp, remote, local, op_timeout).await
    } else {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        download_file(sftp, remote, local, meta.permissions, op_timeout).await
    }
}

async fn download_file(
    sftp: &SftpSession,
    remote: &str,
    local: &Path,
    permissions: Option<u32>,
    op_timeout: Option<Duration>,
) -> Result<(), SshError> {
    let transfer = async {
        let mut file = sftp
            .open_with_flags(remote, OpenFlags::READ)
            .await
            .map_err(|e| SshError::Transfer(format!("open {remote}: {e}")))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await?;

        tokio::fs::write(local, &contents).await?;
        debug!(remote = %remote, local = %local.display(), bytes = contents.len(), "downloaded file");
        Ok(())
    };
    with_timeout(op_timeout, remote, transfer).await?;

    #[cfg(unix)]
    if let Some(mode) = permissions {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(local, std::fs::Permissions::from_mode(mode & 0o777))
            .await;
    }
    #[cfg(not(unix))]
    let _ = permissions;

    Ok(())
}

fn download_dir_recursive<'a>(
    sftp: &'a SftpSession,
    remote: &'a str,
    local: &'a Path,
    op_timeout: Option<Duration>,
) -> Pin<Box<dyn std::future::Future<Output = Result<(), SshError>> + Send + 'a>> {
    Box::pin(async move {
        let entries = sftp
            .read_dir(remote)
            .await
            .map_err(|e| SshError::Transfer(format!("read dir {remote}: {e}")))?;

        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }

            let remote_path = join_remote(remote, &name);
            let local_path = local.join(&name);
            let meta = entry.metadata();

            if meta.is_dir() {
                tokio::fs::create_dir_all(&local_path).await?;
                download_dir_recursive(sftp, &remote_path, &local_path, op_timeout).await?;
            } else {
                download_file(sftp, &remote_path, &local_path, meta.permissions, op_timeout)
                    .await?;
            }
        }

        Ok(())
    })
}

async fn with_timeout<F>(timeout: Option<Duration>, what: &str, fut: F) -> Result<(), SshError>
where
    F: std::future::Future<Output = Result<(), SshError>>,
{
    match timeout {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| SshError::Timeout(format!("transferring {what}")))?,
        None => fut.await,
    }
}

fn local_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .ok()
            .map(|m| m.permissions().mode() & 0o777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}
