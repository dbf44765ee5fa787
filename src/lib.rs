//! sshfleet - batch SSH execution engine
//!
//! Runs one task (remote command, upload-and-run script, file push or file
//! fetch) across a large set of Linux hosts concurrently, collecting a
//! per-host result and an aggregated summary under connection, operation
//! and whole-task deadlines.
//!
//! # Features
//! - Bracket host patterns (`web[01-20].idc[1-2]`) with stable dedup
//! - Layered authentication: password, identity files, ssh-agent
//! - Vault-encrypted passwords and key passphrases at rest
//! - Optional bastion (jump host) tunneling via `direct-tcpip`
//! - Bounded worker pool with streamed results
//! - Sudo execution with localized prompt stripping
//!
//! The terminal CLI, configuration-file loading and output rendering are
//! callers of this crate, not part of it.

pub mod auth;
pub mod expand;
pub mod ssh;
pub mod task;
pub mod vault;

pub use auth::{AuthError, AuthMethod, AuthOptions, BastionOptions, ResolvedAuth};
pub use expand::{expand, expand_all, ExpandError};
pub use ssh::{HostKeyPolicy, SshClient, SshError};
pub use task::{HostResult, HostStatus, Task, TaskConfig, TaskError, TaskOp, TaskReport};
