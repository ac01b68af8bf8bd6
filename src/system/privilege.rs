use std::process::{Command, Stdio};

use nix::unistd::Uid;
use tracing::{info, warn};

use crate::error::{Result, SetupError};

/// Makes sure later `sudo` calls will not prompt inside the TUI.
///
/// Root passes immediately. Otherwise a cached sudo timestamp is accepted,
/// and failing that the user is asked for a password with `sudo -v` while
/// the terminal is still in cooked mode.
pub fn ensure_privileges() -> Result<()> {
    if Uid::effective().is_root() {
        info!("Running as root, skipping sudo check");
        return Ok(());
    }

    let cached = Command::new("sudo")
        .args(["-n", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if cached {
        info!("sudo timestamp is cached");
        return Ok(());
    }

    warn!("sudo timestamp not cached, prompting for password");
    let status = Command::new("sudo")
        .arg("-v")
        .status()
        .map_err(|e| SetupError::Privilege(format!("could not run sudo: {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(SetupError::Privilege(format!(
            "sudo -v failed with code {:?}",
            status.code()
        )))
    }
}
