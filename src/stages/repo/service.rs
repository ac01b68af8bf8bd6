use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{join_all, Command};
use crate::message::Message;
use crate::shield;
use crate::system::{CommandSpec, Executor};

use super::RepoMsg;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("paths cannot be empty or incomplete")]
    IncompleteInput,

    #[error("invalid repository format, expected 'username/repo', got: {0}")]
    InvalidFormat(String),

    #[error("repository not found or access denied")]
    RemoteNotFound,

    #[error("could not create parent directory: {0}")]
    CreateParent(String),

    #[error("no write permission for {}", .0.display())]
    NoWritePermission(PathBuf),

    #[error("destination path exists but is not a directory")]
    NotADirectory,

    #[error("could not read destination directory: {0}")]
    ReadDestination(String),

    #[error("failed to clone repository: {0}")]
    Clone(String),

    #[error("validation did not complete")]
    Incomplete,
}

/// Outcome of a successful destination check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Ready,
    /// Existing non-empty directory. Soft: the user may keep it.
    ExistsNonEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub already_exists: bool,
    pub error: Option<RepoError>,
}

/// Merges the two concurrent checks. A hard failure on either side wins over
/// the soft "already exists" condition.
pub fn combine(
    remote: Result<(), RepoError>,
    destination: Result<Destination, RepoError>,
) -> ValidationOutcome {
    match (remote, destination) {
        (Err(e), _) | (_, Err(e)) => ValidationOutcome {
            already_exists: false,
            error: Some(e),
        },
        (Ok(()), Ok(dest)) => ValidationOutcome {
            already_exists: dest == Destination::ExistsNonEmpty,
            error: None,
        },
    }
}

#[derive(Debug)]
enum Check {
    Remote(Result<(), RepoError>),
    Destination(Result<Destination, RepoError>),
}

type CheckTask = Pin<Box<dyn Future<Output = Check> + Send>>;

#[derive(Debug)]
pub struct RepoService {
    executor: Arc<dyn Executor>,
    host: String,
}

impl RepoService {
    pub fn new(executor: Arc<dyn Executor>, host: &str) -> Self {
        Self {
            executor,
            host: host.to_string(),
        }
    }

    pub fn check_remote(&self, repo: &str) -> Result<(), RepoError> {
        info!("Checking remote repository {}", repo);
        let parts: Vec<&str> = repo.split('/').collect();
        if parts.len() != 2 {
            return Err(RepoError::InvalidFormat(repo.to_string()));
        }

        let url = format!("ssh://git@{}/{}.git", self.host, repo);
        let spec = CommandSpec::new("git").args(["ls-remote", url.as_str()]);
        self.executor.run(&spec).map(|_| ()).map_err(|e| {
            warn!("Remote check for {} failed: {}", repo, e);
            RepoError::RemoteNotFound
        })
    }

    pub fn check_destination(&self, dest: &Path) -> Result<Destination, RepoError> {
        info!("Checking destination {:?}", dest);
        let metadata = match fs::metadata(dest) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return self.probe_parent(dest),
            Err(e) if e.kind() == ErrorKind::NotADirectory => {
                // Some ancestor is a file, so nothing can be created here.
                return Err(RepoError::NoWritePermission(parent_of(dest)));
            }
            Err(e) => return Err(RepoError::ReadDestination(e.to_string())),
        };

        if !metadata.is_dir() {
            return Err(RepoError::NotADirectory);
        }
        let mut entries =
            fs::read_dir(dest).map_err(|e| RepoError::ReadDestination(e.to_string()))?;
        if entries.next().is_some() {
            debug!("Destination {:?} is not empty", dest);
            Ok(Destination::ExistsNonEmpty)
        } else {
            Ok(Destination::Ready)
        }
    }

    /// Creates the parent of a missing destination and proves it is
    /// writable with a scratch file.
    fn probe_parent(&self, dest: &Path) -> Result<Destination, RepoError> {
        let parent = parent_of(dest);
        if self.executor.is_dryrun() {
            info!("[dryrun] would create {:?}", parent);
            return Ok(Destination::Ready);
        }

        if let Err(e) = fs::create_dir_all(&parent) {
            return Err(match e.kind() {
                ErrorKind::PermissionDenied
                | ErrorKind::NotADirectory
                | ErrorKind::AlreadyExists => RepoError::NoWritePermission(parent),
                _ => RepoError::CreateParent(e.to_string()),
            });
        }

        let scratch = parent.join(format!(".archsetup-perm-check-{}", std::process::id()));
        match fs::write(&scratch, b"") {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&scratch) {
                    debug!("Could not remove {:?}: {}", scratch, e);
                }
                Ok(Destination::Ready)
            }
            Err(e) => {
                warn!("Write probe in {:?} failed: {}", parent, e);
                Err(RepoError::NoWritePermission(parent))
            }
        }
    }

    pub fn clone_repo(&self, repo: &str, dest: &Path) -> Result<(), RepoError> {
        let url = format!("git@{}:{}.git", self.host, repo);
        let spec = CommandSpec::new("git").args([
            "clone".to_string(),
            url,
            dest.to_string_lossy().into_owned(),
        ]);
        match self.executor.run(&spec) {
            Ok(_) => {
                info!("Cloned {} into {:?}", repo, dest);
                Ok(())
            }
            Err(e) => Err(RepoError::Clone(e.to_string())),
        }
    }

    /// Runs both checks concurrently and resolves to a single
    /// [`RepoMsg::Validated`].
    pub fn validate(self: &Arc<Self>, repo: String, dest: PathBuf) -> Command {
        let remote = Arc::clone(self);
        let local = Arc::clone(self);
        let tasks: Vec<CheckTask> = vec![
            Box::pin(async move {
                let result = shield::spawn_blocking("repo", move || remote.check_remote(&repo))
                    .await
                    .unwrap_or(Err(RepoError::Incomplete));
                Check::Remote(result)
            }),
            Box::pin(async move {
                let result =
                    shield::spawn_blocking("repo", move || local.check_destination(&dest))
                        .await
                        .unwrap_or(Err(RepoError::Incomplete));
                Check::Destination(result)
            }),
        ];

        join_all(tasks, |checks| {
            let mut remote = Err(RepoError::Incomplete);
            let mut destination = Err(RepoError::Incomplete);
            for check in checks {
                match check {
                    Check::Remote(result) => remote = result,
                    Check::Destination(result) => destination = result,
                }
            }
            Message::Repo(RepoMsg::Validated(combine(remote, destination)))
        })
    }
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
