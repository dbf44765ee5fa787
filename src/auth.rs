//! Credential resolution for target and bastion logins
//!
//! Builds the ordered authentication bundle a connection attempt walks
//! through: password (when known), then each parsed identity file, then
//! the ssh-agent when `SSH_AUTH_SOCK` is reachable. Passwords and key
//! passphrases read from flags or files may be vault envelopes and are
//! decrypted transparently (see [`crate::vault`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::vault;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("read '{path}' failed: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Vault(#[from] vault::VaultError),

    #[error("terminal prompt failed: {0}")]
    Prompt(std::io::Error),
}

/// One candidate authentication method. The first method the server
/// accepts wins; order is fixed by the resolver.
#[derive(Clone)]
pub enum AuthMethod {
    Password(Zeroizing<String>),
    PublicKey {
        path: PathBuf,
        key: Arc<PrivateKey>,
    },
    Agent,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::PublicKey { path, .. } => {
                f.debug_struct("PublicKey").field("path", path).finish()
            }
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

/// Login credential inputs, as handed over by the flag/config layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    /// Login user; defaults to `$USER`.
    pub user: Option<String>,
    /// Password value (may be a vault envelope).
    pub password: Option<String>,
    /// File containing the password, trailing whitespace trimmed.
    pub password_file: Option<PathBuf>,
    /// Force an interactive password prompt; wins over flag and file.
    pub ask_pass: bool,
    /// Private key files; a leading `~/` is expanded.
    pub identity_files: Vec<String>,
    /// Passphrase for encrypted identity files (may be a vault envelope).
    pub passphrase: Option<String>,
    /// File containing the vault passphrase used to decrypt envelopes.
    pub vault_pass_file: Option<PathBuf>,
}

/// Bastion credential inputs. Every unset field falls back to the
/// corresponding target-side value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BastionOptions {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub identity_files: Vec<String>,
    pub passphrase: Option<String>,
}

impl Default for BastionOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: None,
            password: None,
            identity_files: Vec::new(),
            passphrase: None,
        }
    }
}

/// A resolved login: user, plaintext password (possibly empty) and the
/// ordered method bundle.
#[derive(Clone)]
pub struct ResolvedAuth {
    pub user: String,
    pub password: Zeroizing<String>,
    pub methods: Vec<AuthMethod>,
}

/// Bastion login plus its endpoint.
#[derive(Clone)]
pub struct ResolvedBastion {
    pub host: String,
    pub port: u16,
    pub auth: ResolvedAuth,
}

/// Resolves credentials once per task. The vault passphrase is obtained
/// at most once (file or prompt) and cached for every envelope met.
pub struct Resolver {
    opts: AuthOptions,
    bastion: Option<BastionOptions>,
    sudo: bool,
    vault_pass: Option<Zeroizing<String>>,
}

impl Resolver {
    pub fn new(opts: AuthOptions, bastion: Option<BastionOptions>, sudo: bool) -> Self {
        Self {
            opts,
            bastion,
            sudo,
            vault_pass: None,
        }
    }

    /// Resolve the target bundle and, when configured, the bastion bundle.
    pub async fn resolve(mut self) -> Result<(ResolvedAuth, Option<ResolvedBastion>), AuthError> {
        let user = self
            .opts
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        let mut password = self.resolve_password(&user)?;
        let passphrase = self.resolve_passphrase(self.opts.passphrase.clone())?;

        let mut methods = Vec::new();
        if !password.is_empty() {
            methods.push(AuthMethod::Password(password.clone()));
        } else {
            debug!("password of the login user not provided");
        }

        let identity_files = self.opts.identity_files.clone();
        methods.extend(load_identities(&identity_files, &passphrase));

        let agent_reachable = agent_available().await;
        if agent_reachable {
            methods.push(AuthMethod::Agent);
        }

        if methods.is_empty() {
            debug!("no authentication method detected, prompting for password");
            password = prompt_password(&user)?;
            methods.push(AuthMethod::Password(password.clone()));
        } else if self.sudo && password.is_empty() {
            debug!("sudo requested without a password, prompting");
            password = prompt_password(&user)?;
            methods.push(AuthMethod::Password(password.clone()));
        }

        let target = ResolvedAuth {
            user,
            password,
            methods,
        };

        let bastion = match self.bastion.take() {
            Some(opts) if !opts.host.is_empty() => {
                Some(self.resolve_bastion(opts, &target, &passphrase, agent_reachable)?)
            }
            _ => None,
        };

        Ok((target, bastion))
    }

    /// Password priority: interactive prompt, then flag, then file.
    fn resolve_password(&mut self, user: &str) -> Result<Zeroizing<String>, AuthError> {
        let mut password = Zeroizing::new(String::new());

        if let Some(file) = self.opts.password_file.clone() {
            password = Zeroizing::new(read_trimmed(&file)?);
            debug!(path = %file.display(), "read login password from file");
        }

        if let Some(flag) = self.opts.password.clone() {
            password = Zeroizing::new(flag);
            debug!("using login password from flags or configuration");
        }

        password = self.reveal(password)?;

        if self.opts.ask_pass {
            password = prompt_password(user)?;
        }

        Ok(password)
    }

    fn resolve_passphrase(
        &mut self,
        passphrase: Option<String>,
    ) -> Result<Zeroizing<String>, AuthError> {
        match passphrase {
            Some(p) => self.reveal(Zeroizing::new(p)),
            None => Ok(Zeroizing::new(String::new())),
        }
    }

    /// Decrypt a vault envelope in place; plain values pass through.
    fn reveal(&mut self, value: Zeroizing<String>) -> Result<Zeroizing<String>, AuthError> {
        if !vault::is_ciphertext(&value) {
            return Ok(value);
        }

        let vault_pass = self.vault_passphrase()?;
        let plain = vault::decode(&value, &vault_pass)?;
        debug!("decrypted vault-encrypted secret");
        Ok(plain)
    }

    fn vault_passphrase(&mut self) -> Result<Zeroizing<String>, AuthError> {
        if let Some(cached) = &self.vault_pass {
            return Ok(cached.clone());
        }

        let pass = match self.opts.vault_pass_file.clone() {
            Some(file) => Zeroizing::new(read_trimmed(&file)?),
            None => Zeroizing::new(
                rpassword::prompt_password("Vault password: ").map_err(AuthError::Prompt)?,
            ),
        };

        self.vault_pass = Some(pass.clone());
        Ok(pass)
    }

    fn resolve_bastion(
        &mut self,
        opts: BastionOptions,
        target: &ResolvedAuth,
        target_passphrase: &Zeroizing<String>,
        agent_reachable: bool,
    ) -> Result<ResolvedBastion, AuthError> {
        let user = opts.user.unwrap_or_else(|| target.user.clone());

        // Field-by-field fallback to the target-side values.
        let password = match opts.password {
            Some(p) => self.reveal(Zeroizing::new(p))?,
            None => target.password.clone(),
        };
        let passphrase = match opts.passphrase {
            Some(p) => self.reveal(Zeroizing::new(p))?,
            None => target_passphrase.clone(),
        };
        let identity_files = if opts.identity_files.is_empty() {
            self.opts.identity_files.clone()
        } else {
            opts.identity_files
        };

        let mut methods = Vec::new();
        if !password.is_empty() {
            methods.push(AuthMethod::Password(password.clone()));
        }
        methods.extend(load_identities(&identity_files, &passphrase));
        if agent_reachable {
            methods.push(AuthMethod::Agent);
        }

        Ok(ResolvedBastion {
            host: opts.host,
            port: opts.port,
            auth: ResolvedAuth {
                user,
                password,
                methods,
            },
        })
    }
}

/// Load and parse identity files; files that fail to parse (with and
/// without the passphrase) are skipped with a debug log.
fn load_identities(files: &[String], passphrase: &Zeroizing<String>) -> Vec<AuthMethod> {
    let mut methods = Vec::new();

    for file in files {
        let path = PathBuf::from(expand_tilde(file));

        match russh::keys::load_secret_key(&path, None) {
            Ok(key) => {
                debug!(path = %path.display(), "parsed identity file");
                methods.push(AuthMethod::PublicKey {
                    path,
                    key: Arc::new(key),
                });
            }
            Err(first_err) if !passphrase.is_empty() => {
                match russh::keys::load_secret_key(&path, Some(passphrase.as_str())) {
                    Ok(key) => {
                        debug!(path = %path.display(), "parsed identity file with passphrase");
                        methods.push(AuthMethod::PublicKey {
                            path,
                            key: Arc::new(key),
                        });
                    }
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "identity file rejected with passphrase (plain parse: {first_err})");
                    }
                }
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "identity file rejected");
            }
        }
    }

    methods
}

/// Expand a leading `~/` (or bare `~`) to the home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// True when `SSH_AUTH_SOCK` is set and the agent answers a dial.
async fn agent_available() -> bool {
    match std::env::var("SSH_AUTH_SOCK") {
        Ok(sock) if !sock.is_empty() => {
            match russh::keys::agent::client::AgentClient::connect_env().await {
                Ok(_) => {
                    debug!(socket = %sock, "ssh-agent reachable");
                    true
                }
                Err(e) => {
                    debug!(socket = %sock, error = %e, "ssh-agent dial failed");
                    false
                }
            }
        }
        _ => false,
    }
}

fn prompt_password(user: &str) -> Result<Zeroizing<String>, AuthError> {
    rpassword::prompt_password(format!("Password for {user}: "))
        .map(Zeroizing::new)
        .map_err(AuthError::Prompt)
}

fn read_trimmed(path: &Path) -> Result<String, AuthError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim_end().to_string())
        .map_err(|source| AuthError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn resolver(opts: AuthOptions) -> Resolver {
        Resolver::new(opts, None, false)
    }

    #[test]
    fn password_file_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hunter2  ").unwrap();

        let mut r = resolver(AuthOptions {
            password_file: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        let password = r.resolve_password("alice").unwrap();
        assert_eq!(&*password, "hunter2");
    }

    #[test]
    fn flag_password_wins_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();

        let mut r = resolver(AuthOptions {
            password: Some("from-flag".to_string()),
            password_file: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        let password = r.resolve_password("alice").unwrap();
        assert_eq!(&*password, "from-flag");
    }

    #[test]
    fn vault_encrypted_password_is_decrypted() {
        let envelope = crate::vault::encode("real-password", "vault-pass").unwrap();
        let mut vault_file = tempfile::NamedTempFile::new().unwrap();
        write!(vault_file, "vault-pass\n").unwrap();

        let mut r = resolver(AuthOptions {
            password: Some(envelope),
            vault_pass_file: Some(vault_file.path().to_path_buf()),
            ..Default::default()
        });
        let password = r.resolve_password("alice").unwrap();
        assert_eq!(&*password, "real-password");
    }

    #[test]
    fn wrong_vault_passphrase_surfaces_vault_error() {
        let envelope = crate::vault::encode("real-password", "vault-pass").unwrap();
        let mut vault_file = tempfile::NamedTempFile::new().unwrap();
        write!(vault_file, "not-the-pass").unwrap();

        let mut r = resolver(AuthOptions {
            password: Some(envelope),
            vault_pass_file: Some(vault_file.path().to_path_buf()),
            ..Default::default()
        });
        assert!(matches!(
            r.resolve_password("alice"),
            Err(AuthError::Vault(_))
        ));
    }

    #[test]
    fn missing_password_file_is_an_error() {
        let mut r = resolver(AuthOptions {
            password_file: Some(PathBuf::from("/nonexistent/sshfleet-auth-file")),
            ..Default::default()
        });
        assert!(matches!(
            r.resolve_password("alice"),
            Err(AuthError::ReadFile { .. })
        ));
    }

    #[test]
    fn tilde_expansion_targets_home() {
        let expanded = expand_tilde("~/.ssh/id_ed25519");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with(".ssh/id_ed25519"));
        // Paths without a tilde pass through untouched.
        assert_eq!(expand_tilde("/etc/keys/id"), "/etc/keys/id");
    }

    #[test]
    fn unparseable_identity_files_are_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a private key").unwrap();

        let methods = load_identities(
            &[file.path().to_string_lossy().into_owned()],
            &Zeroizing::new(String::new()),
        );
        assert!(methods.is_empty());
    }

    #[test]
    fn bastion_falls_back_to_target_credentials() {
        let mut r = Resolver::new(AuthOptions::default(), None, false);
        let target = ResolvedAuth {
            user: "alice".to_string(),
            password: Zeroizing::new("target-pass".to_string()),
            methods: vec![AuthMethod::Password(Zeroizing::new(
                "target-pass".to_string(),
            ))],
        };

        let bastion = r
            .resolve_bastion(
                BastionOptions {
                    host: "bastion.example.com".to_string(),
                    ..Default::default()
                },
                &target,
                &Zeroizing::new(String::new()),
                false,
            )
            .unwrap();

        assert_eq!(bastion.host, "bastion.example.com");
        assert_eq!(bastion.port, 22);
        assert_eq!(bastion.auth.user, "alice");
        assert_eq!(&*bastion.auth.password, "target-pass");
        assert!(matches!(
            bastion.auth.methods.first(),
            Some(AuthMethod::Password(_))
        ));
    }

    #[test]
    fn bastion_explicit_credentials_are_kept() {
        let mut r = Resolver::new(AuthOptions::default(), None, false);
        let target = ResolvedAuth {
            user: "alice".to_string(),
            password: Zeroizing::new("target-pass".to_string()),
            methods: Vec::new(),
        };

        let bastion = r
            .resolve_bastion(
                BastionOptions {
                    host: "bastion".to_string(),
                    port: 2222,
                    user: Some("jump".to_string()),
                    password: Some("jump-pass".to_string()),
                    ..Default::default()
                },
                &target,
                &Zeroizing::new(String::new()),
                false,
            )
            .unwrap();

        assert_eq!(bastion.port, 2222);
        assert_eq!(bastion.auth.user, "jump");
        assert_eq!(&*bastion.auth.password, "jump-pass");
    }
}
