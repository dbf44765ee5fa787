//! SSH error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("timed out {0}")]
    Timeout(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("remote command exited with status {status}: {output}")]
    RemoteExec { status: u32, output: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("target already exists: {0}")]
    TargetExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for SshError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SshError::Transfer(err.to_string())
    }
}
