use serde::Deserialize;

use crate::system::OsInfo;

/// Contents of the profile definitions file at the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProfileFile {
    pub profiles: Vec<Profile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub description: String,
    /// Package list, relative to the repository.
    pub path: String,
    pub os_family: String,
    pub os_distro: String,
    pub stow_dirs: Vec<String>,
    pub roles: Vec<String>,
    pub post_install: Option<PostInstall>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PostInstall {
    pub description: String,
    pub command: String,
    pub working_dir: String,
}

impl ProfileFile {
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

impl Profile {
    /// Empty filters match every platform.
    pub fn applies_to(&self, os: &OsInfo) -> bool {
        let family = self.os_family.trim().to_lowercase();
        let distro = self.os_distro.trim().to_lowercase();
        (family.is_empty() || family == os.family) && (distro.is_empty() || distro == os.distro)
    }

    /// Value of `MACHINE_PROFILES` for the post-install command.
    pub fn roles_env(&self) -> String {
        self.roles
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// One package per line. Blank lines and `#` comments are skipped.
pub fn parse_package_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}
