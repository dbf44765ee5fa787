//! SSH client factory
//!
//! An [`SshClient`] is an immutable bundle of login credentials and
//! timeouts shared read-only by every worker. [`SshClient::dial`]
//! produces one authenticated connection per call, optionally tunneled
//! through a bastion host with its own credential bundle via a
//! `direct-tcpip` channel.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::error::SshError;
use crate::auth::{AuthMethod, ResolvedAuth, ResolvedBastion};

/// Server host key acceptance policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any server key without verification. The default for batch
    /// fleets, where known_hosts rarely covers every target; the
    /// man-in-the-middle risk is the caller's to weigh.
    #[default]
    AcceptAny,
    /// Verify against `~/.ssh/known_hosts`; unknown and changed keys are
    /// rejected.
    Strict,
    /// Trust on first use: unknown keys are recorded in known_hosts,
    /// changed keys are rejected.
    Tofu,
}

/// russh callback handler carrying the host key policy.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::Strict => {
                match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => Err(SshError::HandshakeFailed(format!(
                        "unknown host key for {}:{}",
                        self.host, self.port
                    ))),
                    Err(e) => Err(SshError::HandshakeFailed(format!(
                        "host key verification for {}:{} failed: {}",
                        self.host, self.port, e
                    ))),
                }
            }
            HostKeyPolicy::Tofu => {
                match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        if let Err(e) =
                            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, server_public_key)
                        {
                            warn!(host = %self.host, error = %e, "failed to record host key");
                        }
                        Ok(true)
                    }
                    Err(e) => Err(SshError::HandshakeFailed(format!(
                        "host key for {}:{} changed: {}",
                        self.host, self.port, e
                    ))),
                }
            }
        }
    }
}

/// An authenticated connection. When the target was reached through a
/// bastion, the bastion handle is held alive for the tunnel's lifetime
/// and both connections close together.
pub struct DialedHost {
    pub handle: Handle<ClientHandler>,
    bastion: Option<Handle<ClientHandler>>,
}

impl DialedHost {
    /// Disconnect gracefully; errors are ignored, the drop closes the
    /// underlying sockets regardless.
    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        if let Some(bastion) = self.bastion {
            let _ = bastion
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
        }
    }
}

/// Shared per-task SSH dialer.
pub struct SshClient {
    auth: ResolvedAuth,
    bastion: Option<ResolvedBastion>,
    port: u16,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
    policy: HostKeyPolicy,
}

impl SshClient {
    pub fn new(auth: ResolvedAuth) -> Self {
        Self {
            auth,
            bastion: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
            policy: HostKeyPolicy::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound for each session operation (a command run or one SFTP file
    /// transfer). `None` leaves operations unbounded.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_bastion(mut self, bastion: ResolvedBastion) -> Self {
        self.bastion = Some(bastion);
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn user(&self) -> &str {
        &self.auth.user
    }

    pub(crate) fn password(&self) -> &Zeroizing<String> {
        &self.auth.password
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    /// Dial and authenticate one target.
    pub async fn dial(&self, host: &str, port: u16) -> Result<DialedHost, SshError> {
        match &self.bastion {
            None => {
                let handle = self.connect_direct(host, port, &self.auth).await?;
                Ok(DialedHost {
                    handle,
                    bastion: None,
                })
            }
            Some(bastion) => self.connect_via_bastion(bastion, host, port).await,
        }
    }

    fn config() -> client::Config {
        client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        }
    }

    async fn connect_direct(
        &self,
        host: &str,
        port: u16,
        auth: &ResolvedAuth,
    ) -> Result<Handle<ClientHandler>, SshError> {
        let addr = format!("{host}:{port}");
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Unreachable(format!("resolve {addr}: {e}")))?
            .next()
            .ok_or_else(|| SshError::Unreachable(format!("no address found for {addr}")))?;

        debug!(addr = %addr, "connecting");

        let handler = ClientHandler::new(host.to_string(), port, self.policy);
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(Self::config()), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("connecting to {addr}")))?
        .map_err(|e| classify_connect_error(&addr, e))?;

        self.authenticate(&mut handle, host, auth).await?;
        Ok(handle)
    }

    async fn connect_via_bastion(
        &self,
        bastion: &ResolvedBastion,
        host: &str,
        port: u16,
    ) -> Result<DialedHost, SshError> {
        debug!(bastion = %bastion.host, target = %host, "dialing through bastion");

        let bastion_handle = self
            .connect_direct(&bastion.host, bastion.port, &bastion.auth)
            .await?;

        let channel = bastion_handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SshError::Unreachable(format!(
                    "tunnel to {host}:{port} via {}: {e}",
                    bastion.host
                ))
            })?;

        let handler = ClientHandler::new(host.to_string(), port, self.policy);
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect_stream(Arc::new(Self::config()), channel.into_stream(), handler),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!("connecting to {host}:{port} through {}", bastion.host))
        })?
        .map_err(|e| classify_connect_error(&format!("{host}:{port}"), e))?;

        self.authenticate(&mut handle, host, &self.auth).await?;

        Ok(DialedHost {
            handle,
            bastion: Some(bastion_handle),
        })
    }

    /// Walk the bundle in order; the first method the server accepts wins.
    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        host: &str,
        auth: &ResolvedAuth,
    ) -> Result<(), SshError> {
        for method in &auth.methods {
            match self.try_method(handle, &auth.user, method).await {
                Ok(true) => {
                    debug!(host = %host, method = ?method, "authenticated");
                    return Ok(());
                }
                Ok(false) => debug!(host = %host, method = ?method, "method rejected"),
                Err(e) => debug!(host = %host, method = ?method, error = %e, "method failed"),
            }
        }

        Err(SshError::AuthFailed(format!(
            "no authentication method accepted by {host} for user '{}'",
            auth.user
        )))
    }

    async fn try_method(
        &self,
        handle: &mut Handle<ClientHandler>,
        user: &str,
        method: &AuthMethod,
    ) -> Result<bool, SshError> {
        match method {
            AuthMethod::Password(password) => Ok(handle
                .authenticate_password(user, password.as_str())
                .await?
                .success()),
            AuthMethod::PublicKey { key, .. } => {
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                let key = PrivateKeyWithHashAlg::new(key.clone(), hash);
                Ok(handle.authenticate_publickey(user, key).await?.success())
            }
            AuthMethod::Agent => {
                let mut agent = russh::keys::agent::client::AgentClient::connect_env()
                    .await
                    .map_err(|e| SshError::AuthFailed(format!("ssh-agent: {e}")))?;
                let identities = agent
                    .request_identities()
                    .await
                    .map_err(|e| SshError::AuthFailed(format!("ssh-agent identities: {e}")))?;

                for identity in identities {
                    let hash = handle.best_supported_rsa_hash().await?.flatten();
                    if let Ok(result) = handle
                        .authenticate_publickey_with(user, identity, hash, &mut agent)
                        .await
                    {
                        if result.success() {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
        }
    }
}

fn classify_connect_error(addr: &str, err: SshError) -> SshError {
    match err {
        SshError::Io(e) => SshError::Unreachable(format!("{addr}: {e}")),
        other => SshError::HandshakeFailed(format!("{addr}: {other}")),
    }
}

/// Split `host[:port]`, falling back to `default_port`. Bracketed IPv6
/// (`[::1]:22`) is honored; a bare IPv6 address is all host.
pub(crate) fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once(']') {
            if let Some(port) = port.strip_prefix(':').and_then(|p| p.parse().ok()) {
                return (host.to_string(), port);
            }
            return (host.to_string(), default_port);
        }
    }

    if target.matches(':').count() == 1 {
        if let Some((host, port)) = target.split_once(':') {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
    }

    (target.to_string(), default_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_policy_defaults_to_accept_any() {
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(split_host_port("web01", 22), ("web01".to_string(), 22));
        assert_eq!(
            split_host_port("web01:2222", 22),
            ("web01".to_string(), 2222)
        );
        assert_eq!(
            split_host_port("10.0.0.1:922", 22),
            ("10.0.0.1".to_string(), 922)
        );
        // Bare IPv6 stays whole, bracketed form may carry a port.
        assert_eq!(split_host_port("::1", 22), ("::1".to_string(), 22));
        assert_eq!(split_host_port("[::1]:2022", 22), ("::1".to_string(), 2022));
        assert_eq!(split_host_port("[::1]", 22), ("::1".to_string(), 22));
        // Unparseable port falls back to the default.
        assert_eq!(split_host_port("web01:abc", 22), ("web01:abc".to_string(), 22));
    }

    #[test]
    fn client_builder_applies_options() {
        let auth = ResolvedAuth {
            user: "alice".to_string(),
            password: Zeroizing::new(String::new()),
            methods: Vec::new(),
        };
        let client = SshClient::new(auth)
            .with_port(2222)
            .with_connect_timeout(Duration::from_secs(3))
            .with_command_timeout(Some(Duration::from_secs(60)))
            .with_host_key_policy(HostKeyPolicy::Strict);

        assert_eq!(client.port(), 2222);
        assert_eq!(client.user(), "alice");
        assert_eq!(client.command_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(client.policy, HostKeyPolicy::Strict);
    }

    #[tokio::test]
    async fn dial_refused_port_is_unreachable() {
        let auth = ResolvedAuth {
            user: "alice".to_string(),
            password: Zeroizing::new("x".to_string()),
            methods: vec![AuthMethod::Password(Zeroizing::new("x".to_string()))],
        };
        // Port 1 on localhost is essentially never listening.
        let client = SshClient::new(auth).with_connect_timeout(Duration::from_secs(2));
        match client.dial("127.0.0.1", 1).await {
            Err(SshError::Unreachable(_)) | Err(SshError::Timeout(_)) => {}
            other => panic!("expected Unreachable or Timeout, got {:?}", other.map(|_| ())),
        }
    }
}
