use std::path::Path;

use ini::{Ini, ParseOption};
use tracing::{debug, warn};

const OS_RELEASE: &str = "/etc/os-release";

const ARCH_LIKE: [&str; 6] = [
    "arch",
    "archlinux",
    "manjaro",
    "endeavouros",
    "garuda",
    "archarm",
];

/// Platform facts used to filter profiles and pick a package manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    /// `linux`, `macos`, ...
    pub family: String,
    /// Lowercased os-release `ID` on Linux, `macos` on macOS.
    pub distro: String,
}

impl OsInfo {
    pub fn new(family: &str, distro: &str) -> Self {
        Self {
            family: family.to_lowercase(),
            distro: distro.to_lowercase(),
        }
    }

    pub fn detect() -> Self {
        let family = std::env::consts::OS;
        let distro = match family {
            "linux" => read_distro(Path::new(OS_RELEASE)).unwrap_or_default(),
            "macos" => "macos".to_string(),
            _ => String::new(),
        };
        let info = Self::new(family, &distro);
        debug!("Detected platform {:?}", info);
        info
    }

    pub fn is_arch_like(&self) -> bool {
        self.family == "linux" && ARCH_LIKE.contains(&self.distro.as_str())
    }

    pub fn is_macos(&self) -> bool {
        self.family == "macos"
    }
}

fn read_distro(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_os_release(&content),
        Err(e) => {
            warn!("Could not read {:?}: {}", path, e);
            None
        }
    }
}

/// Extracts the lowercased `ID` from os-release content.
pub fn parse_os_release(content: &str) -> Option<String> {
    let option = ParseOption {
        enabled_quote: true,
        enabled_escape: false,
        ..Default::default()
    };
    let ini = Ini::load_from_str_opt(content, option).ok()?;
    let id = ini.general_section().get("ID")?;
    let id = id.trim().trim_matches(|c| c == '"' || c == '\'').to_lowercase();
    (!id.is_empty()).then_some(id)
}
