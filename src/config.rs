use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;

pub const DEFAULT_DRIVER_PACKAGES: [&str; 7] = [
    "nvidia-dkms",
    "nvidia-utils",
    "lib32-nvidia-utils",
    "vulkan-icd-loader",
    "lib32-vulkan-icd-loader",
    "nvidia-settings",
    "libva-nvidia-driver",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub general: GeneralConfig,
    pub identity: IdentityConfig,
    pub repo: RepoConfig,
    pub driver: DriverConfig,
    pub profiles: ProfilesConfig,
}

impl SetupConfig {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: SetupConfig = toml::from_str(&content)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub title: String,
    /// Log commands instead of running them.
    pub dryrun: bool,
    pub tick_rate_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            title: "BAS - Bootstrap All Systems".to_string(),
            dryrun: false,
            tick_rate_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Defaults to `~/.ssh`.
    pub ssh_dir: Option<PathBuf>,
    pub host: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            ssh_dir: None,
            host: "github.com".to_string(),
        }
    }
}

impl IdentityConfig {
    pub fn resolve_ssh_dir(&self, dryrun: bool) -> PathBuf {
        if let Some(dir) = &self.ssh_dir {
            return dir.clone();
        }
        if dryrun {
            return std::env::temp_dir().join("archsetup-dryrun-ssh");
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Defaults to `~/Developer/dotfiles`.
    pub default_destination: Option<PathBuf>,
}

impl RepoConfig {
    pub fn resolve_destination(&self) -> PathBuf {
        self.default_destination.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Developer")
                .join("dotfiles")
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub packages: Vec<String>,
    /// Full command line replacing the pacman invocation, split with shell
    /// quoting rules.
    pub command: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            packages: DEFAULT_DRIVER_PACKAGES.iter().map(|p| p.to_string()).collect(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    pub file_name: String,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            file_name: "bas_settings.toml".to_string(),
        }
    }
}
