use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::IdentityConfig;
use crate::message::StatusUpdate;
use crate::system::{CommandSpec, Executor};

const KEY_NAME: &str = "id_ed25519";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("could not prepare {}: {reason}", .path.display())]
    SshDir { path: PathBuf, reason: String },

    #[error("could not read public key {}: {reason}", .path.display())]
    ReadKey { path: PathBuf, reason: String },

    #[error("ssh-keygen failed: {0}")]
    KeyGen(String),

    #[error("generated public key is empty")]
    EmptyKey,

    #[error("SSH connection failed: {0}")]
    Connection(String),

    #[error("could not update known_hosts: {0}")]
    KnownHosts(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    pub exists: bool,
    pub authenticated: bool,
    pub username: Option<String>,
    pub public_key: Option<String>,
}

/// SSH key management and the GitHub connectivity probe.
#[derive(Debug)]
pub struct IdentityService {
    executor: Arc<dyn Executor>,
    ssh_dir: PathBuf,
    host: String,
}

impl IdentityService {
    pub fn new(executor: Arc<dyn Executor>, config: &IdentityConfig) -> Self {
        let ssh_dir = config.resolve_ssh_dir(executor.is_dryrun());
        Self {
            executor,
            ssh_dir,
            host: config.host.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn key_path(&self) -> PathBuf {
        self.ssh_dir.join(KEY_NAME)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.ssh_dir.join(format!("{KEY_NAME}.pub"))
    }

    fn ensure_ssh_dir(&self) -> Result<(), IdentityError> {
        let to_err = |e: std::io::Error| IdentityError::SshDir {
            path: self.ssh_dir.clone(),
            reason: e.to_string(),
        };
        fs::create_dir_all(&self.ssh_dir).map_err(to_err)?;
        fs::set_permissions(&self.ssh_dir, fs::Permissions::from_mode(0o700)).map_err(to_err)
    }

    /// Replaces any recorded host keys for the host with freshly scanned
    /// ones so the non-interactive probe cannot trip over a stale entry.
    pub fn ensure_known_host(&self) -> Result<(), IdentityError> {
        self.ensure_ssh_dir()?;
        let known_hosts = self.ssh_dir.join("known_hosts");

        let remove = CommandSpec::new("ssh-keygen")
            .arg("-f")
            .arg(known_hosts.to_string_lossy())
            .args(["-R", self.host.as_str()]);
        if let Err(e) = self.executor.output(&remove) {
            debug!("Ignoring known_hosts cleanup failure: {}", e);
        }

        let scan =
            CommandSpec::new("ssh-keyscan").args(["-t", "ed25519,ecdsa,rsa", self.host.as_str()]);
        let output = self
            .executor
            .run(&scan)
            .map_err(|e| IdentityError::KnownHosts(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&known_hosts)
            .map_err(|e| IdentityError::KnownHosts(e.to_string()))?;
        file.write_all(output.stdout.as_bytes())
            .map_err(|e| IdentityError::KnownHosts(e.to_string()))?;
        info!("Refreshed {} host keys in {:?}", self.host, known_hosts);
        Ok(())
    }

    fn probe_spec(&self) -> CommandSpec {
        CommandSpec::new("ssh").args([
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            format!("git@{}", self.host),
        ])
    }

    /// Asks the host who we are. GitHub always exits nonzero for `ssh -T`,
    /// so only the greeting matters.
    pub fn check_connection(&self) -> (bool, Option<String>) {
        match self.executor.output(&self.probe_spec()) {
            Ok(output) => parse_ssh_output(&output.combined()),
            Err(e) => {
                warn!("SSH probe could not run: {}", e);
                (false, None)
            }
        }
    }

    pub fn probe(&self) -> StatusUpdate {
        let (authenticated, username) = self.check_connection();
        info!("Auth probe: authenticated={} user={:?}", authenticated, username);
        StatusUpdate::Auth {
            authenticated,
            username,
        }
    }

    pub fn check_key(&self) -> Result<KeyStatus, IdentityError> {
        if let Err(e) = self.ensure_known_host() {
            warn!("Continuing without refreshed host keys: {}", e);
        }

        let path = self.public_key_path();
        let public_key = match fs::read_to_string(&path) {
            Ok(key) => key.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No SSH key at {:?}", path);
                return Ok(KeyStatus {
                    exists: false,
                    authenticated: false,
                    username: None,
                    public_key: None,
                });
            }
            Err(e) => {
                return Err(IdentityError::ReadKey {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let (authenticated, username) = self.check_connection();
        Ok(KeyStatus {
            exists: true,
            authenticated,
            username,
            public_key: Some(public_key),
        })
    }

    pub fn generate_key(&self) -> Result<String, IdentityError> {
        self.ensure_ssh_dir()?;
        let key_path = self.key_path();
        let spec = CommandSpec::new("ssh-keygen").args([
            "-t".to_string(),
            "ed25519".to_string(),
            "-N".to_string(),
            String::new(),
            "-C".to_string(),
            key_comment(),
            "-f".to_string(),
            key_path.to_string_lossy().into_owned(),
        ]);
        self.executor
            .run(&spec)
            .map_err(|e| IdentityError::KeyGen(e.to_string()))?;

        let public_path = self.public_key_path();
        if self.executor.is_dryrun() && !public_path.exists() {
            let stub = format!("ssh-ed25519 AAAAC3dryrun {}\n", key_comment());
            fs::write(&public_path, stub).map_err(|e| IdentityError::ReadKey {
                path: public_path.clone(),
                reason: e.to_string(),
            })?;
        }

        let key = fs::read_to_string(&public_path).map_err(|e| IdentityError::ReadKey {
            path: public_path.clone(),
            reason: e.to_string(),
        })?;
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(IdentityError::EmptyKey);
        }
        info!("Generated SSH key at {:?}", key_path);
        Ok(key)
    }

    pub fn verify(&self) -> Result<String, IdentityError> {
        if let Err(e) = self.ensure_known_host() {
            warn!("Continuing without refreshed host keys: {}", e);
        }
        let output = self
            .executor
            .output(&self.probe_spec())
            .map_err(|e| IdentityError::Connection(e.to_string()))?;
        let combined = output.combined();
        match parse_ssh_output(&combined) {
            (true, username) => Ok(username.unwrap_or_default()),
            (false, _) => Err(IdentityError::Connection(combined)),
        }
    }
}

/// Reads the GitHub greeting, e.g.
/// `Hi octocat! You've successfully authenticated, but ...`.
pub fn parse_ssh_output(output: &str) -> (bool, Option<String>) {
    output
        .lines()
        .find(|line| line.contains("successfully authenticated"))
        .map(|line| {
            let username = line
                .split_whitespace()
                .nth(1)
                .map(|field| field.trim_end_matches('!').to_string())
                .filter(|name| !name.is_empty());
            (true, username)
        })
        .unwrap_or((false, None))
}

fn key_comment() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "archsetup".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::CommandOutput;
    use crate::system::mock::MockExecutor;

    const GREETING: &str =
        "Hi octocat! You've successfully authenticated, but GitHub does not provide shell access.";

    fn service(
        executor: MockExecutor,
        dir: &std::path::Path,
    ) -> (IdentityService, Arc<MockExecutor>) {
        let executor = Arc::new(executor);
        let config = IdentityConfig {
            ssh_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        (IdentityService::new(executor.clone(), &config), executor)
    }

    fn authenticated() -> MockExecutor {
        MockExecutor::new().respond(
            "ssh",
            CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: GREETING.to_string(),
            },
        )
    }

    #[test]
    fn test_parse_ssh_output_success() {
        assert_eq!(parse_ssh_output(GREETING), (true, Some("octocat".to_string())));
    }

    #[test]
    fn test_parse_ssh_output_failure() {
        assert_eq!(
            parse_ssh_output("git@github.com: Permission denied (publickey)."),
            (false, None)
        );
    }

    #[test]
    fn test_check_key_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let (service, executor) = service(authenticated(), dir.path());
        let status = service.check_key().unwrap();
        assert!(!status.exists);
        // No probe is needed when there is no key.
        assert!(!executor.called("ssh"));
    }

    #[test]
    fn test_check_key_with_authenticated_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAA test\n").unwrap();
        let (service, _) = service(authenticated(), dir.path());
        let status = service.check_key().unwrap();
        assert_eq!(
            status,
            KeyStatus {
                exists: true,
                authenticated: true,
                username: Some("octocat".to_string()),
                public_key: Some("ssh-ed25519 AAAA test".to_string()),
            }
        );
    }

    #[test]
    fn test_known_hosts_receives_scanned_keys() {
        let dir = tempfile::tempdir().unwrap();
        let executor = MockExecutor::new()
            .respond("ssh-keyscan", CommandOutput::ok("github.com ssh-ed25519 AAAAscan\n"));
        let (service, executor) = service(executor, dir.path());
        service.ensure_known_host().unwrap();

        let known = fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert_eq!(known, "github.com ssh-ed25519 AAAAscan\n");
        let calls = executor.calls();
        assert_eq!(calls[0].program, "ssh-keygen");
        assert!(calls[0].args.contains(&"-R".to_string()));
        assert_eq!(calls[1].program, "ssh-keyscan");
    }

    #[test]
    fn test_generate_key_reports_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("id_ed25519.pub"), "  \n").unwrap();
        let (service, _) = service(MockExecutor::new(), dir.path());
        assert_eq!(service.generate_key(), Err(IdentityError::EmptyKey));
    }

    #[test]
    fn test_generate_key_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(MockExecutor::new().fail("ssh-keygen", 1, "boom"), dir.path());
        assert!(matches!(service.generate_key(), Err(IdentityError::KeyGen(_))));
    }

    #[test]
    fn test_verify_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = MockExecutor::new().fail("ssh", 255, "Permission denied (publickey).");
        let (service, _) = service(executor, dir.path());
        assert_eq!(
            service.verify(),
            Err(IdentityError::Connection("Permission denied (publickey).".to_string()))
        );
        assert_eq!(
            IdentityError::Connection("x".into()).to_string(),
            "SSH connection failed: x"
        );
    }
}
