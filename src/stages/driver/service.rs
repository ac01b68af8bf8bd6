use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DriverConfig;
use crate::message::StatusUpdate;
use crate::system::{CommandSpec, Executor};

#[derive(Debug)]
pub struct DriverService {
    executor: Arc<dyn Executor>,
    packages: Vec<String>,
    command: Option<String>,
}

impl DriverService {
    pub fn new(executor: Arc<dyn Executor>, config: &DriverConfig) -> Self {
        Self {
            executor,
            packages: config.packages.clone(),
            command: config.command.clone(),
        }
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Any failure to run `lspci` counts as no NVIDIA GPU.
    pub fn detect_gpu(&self) -> bool {
        match self.executor.run(&CommandSpec::new("lspci")) {
            Ok(output) => output.stdout.to_lowercase().contains("nvidia"),
            Err(e) => {
                warn!("GPU probe failed: {}", e);
                false
            }
        }
    }

    pub fn probe(&self) -> StatusUpdate {
        let nvidia = self.detect_gpu();
        info!("GPU probe: nvidia={}", nvidia);
        StatusUpdate::Gpu { nvidia }
    }

    /// The configured override when it parses, otherwise pacman with the
    /// package list.
    pub fn install_spec(&self) -> CommandSpec {
        if let Some(line) = &self.command {
            match shell_words::split(line) {
                Ok(words) if !words.is_empty() => {
                    let mut words = words.into_iter();
                    if let Some(program) = words.next() {
                        return CommandSpec::new(program).args(words);
                    }
                }
                Ok(_) => warn!("Ignoring empty driver command override"),
                Err(e) => warn!("Ignoring driver command override {:?}: {}", line, e),
            }
        }
        CommandSpec::new("sudo")
            .args(["pacman", "-S", "--noconfirm", "--needed"])
            .args(self.packages.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::mock::MockExecutor;
    use crate::system::CommandOutput;

    fn service(executor: MockExecutor, config: DriverConfig) -> DriverService {
        DriverService::new(Arc::new(executor), &config)
    }

    #[test]
    fn test_detect_gpu_is_case_insensitive() {
        let executor = MockExecutor::new().respond(
            "lspci",
            CommandOutput::ok("01:00.0 VGA compatible controller: Nvidia Corporation GA104\n"),
        );
        assert!(service(executor, DriverConfig::default()).detect_gpu());
    }

    #[test]
    fn test_detect_gpu_failure_means_no_gpu() {
        let executor = MockExecutor::new().fail("lspci", 127, "lspci: not found");
        assert_eq!(
            service(executor, DriverConfig::default()).probe(),
            StatusUpdate::Gpu { nvidia: false }
        );
    }

    #[test]
    fn test_default_install_spec() {
        let spec = service(MockExecutor::new(), DriverConfig::default()).install_spec();
        assert_eq!(spec.program, "sudo");
        assert_eq!(&spec.args[..4], ["pacman", "-S", "--noconfirm", "--needed"]);
        assert_eq!(spec.args.len(), 4 + crate::config::DEFAULT_DRIVER_PACKAGES.len());
        assert!(spec.args.contains(&"nvidia-dkms".to_string()));
    }

    #[test]
    fn test_command_override_uses_shell_words() {
        let config = DriverConfig {
            command: Some("sh -c 'echo installing drivers'".to_string()),
            ..Default::default()
        };
        let spec = service(MockExecutor::new(), config).install_spec();
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, ["-c", "echo installing drivers"]);
    }

    #[test]
    fn test_unparseable_override_falls_back() {
        let config = DriverConfig {
            command: Some("echo 'unterminated".to_string()),
            ..Default::default()
        };
        assert_eq!(service(MockExecutor::new(), config).install_spec().program, "sudo");
    }
}
