//! SSH connection and per-host task execution
//!
//! [`SshClient`] builds authenticated connections (optionally tunneled
//! through a bastion) from an immutable auth bundle; [`SessionExecutor`]
//! runs one task operation on top of a dialed connection and its SFTP
//! subsystem.

mod client;
mod error;
mod session;
mod sftp;

pub use client::{ClientHandler, DialedHost, HostKeyPolicy, SshClient};
pub use error::SshError;
pub use session::{ExecOptions, SessionExecutor, SudoPromptFilter, TaskOp};
