use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::config::{parse_package_list, PostInstall, Profile, ProfileFile};
use crate::config::ProfilesConfig;
use crate::system::{CommandSpec, Executor, OsInfo};

const YAY_BOOTSTRAP: &str = r#"set -e
echo "--- Installing dependencies for yay (git, base-devel) ---"
sudo pacman -S --noconfirm --needed git base-devel
echo "--- Cloning yay from AUR ---"
workdir=$(mktemp -d)
git clone https://aur.archlinux.org/yay.git "$workdir/yay"
echo "--- Building and installing yay ---"
cd "$workdir/yay"
makepkg -si --noconfirm
cd /
rm -rf "$workdir"
echo "--- yay installation complete ---"
"#;

const BREW_BOOTSTRAP: &str = r#"set -e
if ! command -v brew >/dev/null 2>&1; then
  echo '--- Installing Homebrew ---'
  /bin/bash -c "$(curl -fsSL https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh)"
  test -x /opt/homebrew/bin/brew && eval "$(/opt/homebrew/bin/brew shellenv)"
  test -x /usr/local/bin/brew && eval "$(/usr/local/bin/brew shellenv)"
fi
echo '--- Ensuring prerequisites ---'
brew install stow
"#;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("no dotfiles repository has been set up")]
    NoRepository,

    #[error("dotfiles path does not exist: {}", .0.display())]
    PathMissing(PathBuf),

    #[error("dotfiles path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("error accessing dotfiles path: {0}")]
    Access(String),

    #[error("could not read {file}: {reason}")]
    ReadConfig { file: String, reason: String },

    #[error("invalid {file} format: {reason}")]
    InvalidConfig { file: String, reason: String },

    #[error("could not open package list {}: {reason}", .path.display())]
    PackageList { path: PathBuf, reason: String },

    #[error("unsupported platform for package install: {0}")]
    UnsupportedPlatform(String),

    #[error("failed to install package manager: {0}")]
    Bootstrap(String),

    #[error("stow failed: {0}")]
    Stow(String),

    #[error("post-install command failed: {0}")]
    PostInstall(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Yay,
    Brew,
}

impl PackageManager {
    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Yay => "yay",
            PackageManager::Brew => "brew",
        }
    }
}

#[derive(Debug)]
pub struct ProfileService {
    executor: Arc<dyn Executor>,
    file_name: String,
    os: OsInfo,
}

impl ProfileService {
    pub fn new(executor: Arc<dyn Executor>, config: &ProfilesConfig, os: OsInfo) -> Self {
        Self {
            executor,
            file_name: config.file_name.clone(),
            os,
        }
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    /// `Ok(None)` when the repository has no definitions file.
    pub fn load_profiles(&self, repo: &Path) -> Result<Option<Vec<Profile>>, ProfileError> {
        match fs::metadata(repo) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(ProfileError::NotADirectory(repo.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProfileError::PathMissing(repo.to_path_buf()));
            }
            Err(e) => return Err(ProfileError::Access(e.to_string())),
        }

        let path = repo.join(&self.file_name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No {} in {:?}", self.file_name, repo);
                return Ok(None);
            }
            Err(e) => {
                return Err(ProfileError::ReadConfig {
                    file: self.file_name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let file = ProfileFile::parse(&content).map_err(|e| ProfileError::InvalidConfig {
            file: self.file_name.clone(),
            reason: e.to_string(),
        })?;
        let total = file.profiles.len();
        let profiles: Vec<Profile> = file
            .profiles
            .into_iter()
            .filter(|p| p.applies_to(&self.os))
            .collect();
        info!(
            "Loaded {} profile(s), {} apply to {}/{}",
            total,
            profiles.len(),
            self.os.family,
            self.os.distro
        );
        Ok(Some(profiles))
    }

    pub fn load_packages(&self, repo: &Path, list: &str) -> Result<Vec<String>, ProfileError> {
        let path = repo.join(list);
        let content = fs::read_to_string(&path).map_err(|e| ProfileError::PackageList {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(parse_package_list(&content))
    }

    pub fn package_manager(&self) -> Result<PackageManager, ProfileError> {
        if self.os.is_arch_like() {
            Ok(PackageManager::Yay)
        } else if self.os.is_macos() {
            Ok(PackageManager::Brew)
        } else {
            Err(ProfileError::UnsupportedPlatform(format!(
                "{}/{}",
                self.os.family, self.os.distro
            )))
        }
    }

    /// Whether the platform's package manager is already on `PATH`.
    pub fn check_package_manager(&self) -> Result<bool, ProfileError> {
        let manager = self.package_manager()?;
        let found = self.executor.lookup(manager.program());
        info!("Package manager {}: {:?}", manager.program(), found);
        Ok(found.is_some())
    }

    pub fn bootstrap_spec(&self, manager: PackageManager) -> CommandSpec {
        let script = match manager {
            PackageManager::Yay => YAY_BOOTSTRAP,
            PackageManager::Brew => BREW_BOOTSTRAP,
        };
        CommandSpec::new("bash").args(["-c", script])
    }

    pub fn install_spec(&self, manager: PackageManager, package: &str) -> CommandSpec {
        match manager {
            PackageManager::Yay => {
                CommandSpec::new("yay").args(["-S", "--noconfirm", "--needed", package])
            }
            PackageManager::Brew => {
                let quoted = shell_escape::escape(package.into());
                let script = format!(
                    "brew list --formula {quoted} >/dev/null 2>&1 || brew install {quoted} \
                     || brew list --cask {quoted} >/dev/null 2>&1 || brew install --cask {quoted}"
                );
                CommandSpec::new("bash").args(["-lc".to_string(), script])
            }
        }
    }

    /// Links the profile's directories into `$HOME`. Nothing to do without
    /// directories.
    pub fn stow(&self, repo: &Path, dirs: &[String]) -> Result<(), ProfileError> {
        if dirs.is_empty() {
            info!("No directories to stow");
            return Ok(());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| ProfileError::Stow("could not determine the home directory".into()))?;
        let spec = CommandSpec::new("stow")
            .arg("-t")
            .arg(home.to_string_lossy())
            .arg("-R")
            .args(dirs.iter().cloned())
            .current_dir(repo);
        self.executor.run(&spec).map_err(|e| {
            warn!("stow failed: {}", e);
            ProfileError::Stow(e.to_string())
        })?;
        info!("Stowed {:?}", dirs);
        Ok(())
    }

    pub fn post_install_spec(&self, repo: &Path, post: &PostInstall, roles: &str) -> CommandSpec {
        CommandSpec::new("sh")
            .args(["-c", post.command.as_str()])
            .current_dir(repo.join(&post.working_dir))
            .env("MACHINE_PROFILES", roles)
    }
}
