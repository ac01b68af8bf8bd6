use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, info};

use crate::process::{self, ProcessHandle, StreamId};

/// A program invocation, kept as data so it can be logged, mocked and
/// replayed in dry-run mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-quoted command line for logs and dry-run output.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| shell_escape::escape(Cow::Borrowed(part.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !out.is_empty() && !err.is_empty() {
            out.push('\n');
        }
        out.push_str(err);
        out
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} failed with code {code:?}: {output}")]
    Failed {
        program: String,
        code: Option<i32>,
        output: String,
    },
}

/// Runs external programs. Implementations must be shareable across the
/// blocking pool and the async tasks that stream output.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Runs to completion and captures both pipes. A nonzero exit is not an
    /// error at this level.
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Starts a streamed process. Called from inside the runtime.
    fn stream(&self, id: StreamId, spec: &CommandSpec) -> io::Result<ProcessHandle> {
        process::spawn(id, spec)
    }

    /// Resolves a program on `PATH`.
    fn lookup(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn is_dryrun(&self) -> bool {
        false
    }

    /// Like [`Executor::output`] but a nonzero exit becomes
    /// [`ExecError::Failed`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let output = self.output(spec)?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::Failed {
                program: spec.program.clone(),
                code: output.code,
                output: output.combined(),
            })
        }
    }
}

/// Executes real system commands.
#[derive(Debug, Default)]
pub struct LiveExecutor;

impl Executor for LiveExecutor {
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        debug!("Running: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let output = command.output().map_err(|e| ExecError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Logs commands instead of running them. Probes get canned answers so every
/// stage can be walked through end to end.
#[derive(Debug, Default)]
pub struct DryrunExecutor;

impl Executor for DryrunExecutor {
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        info!("[dryrun] {}", spec.display());
        let output = match spec.program.as_str() {
            "ssh" => CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "Hi dryrun! You've successfully authenticated, but GitHub does not provide shell access.".to_string(),
            },
            "lspci" => CommandOutput::ok(
                "01:00.0 VGA compatible controller: NVIDIA Corporation (dryrun)\n",
            ),
            "ssh-keyscan" => CommandOutput::ok("github.com ssh-ed25519 AAAAdryrun\n"),
            _ => CommandOutput::ok(""),
        };
        Ok(output)
    }

    fn stream(&self, id: StreamId, spec: &CommandSpec) -> io::Result<ProcessHandle> {
        info!("[dryrun] stream {}: {}", id, spec.display());
        let echo = CommandSpec::new("echo").arg(format!("[dryrun] {}", spec.display()));
        process::spawn(id, &echo)
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        Some(PathBuf::from(program))
    }

    fn is_dryrun(&self) -> bool {
        true
    }
}
