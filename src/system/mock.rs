//! Scripted executor for tests.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use super::executor::{CommandOutput, CommandSpec, ExecError, Executor};
use crate::process::{self, ProcessHandle, StreamId};

/// Answers are keyed by `"program subcommand"` first, then by `"program"`.
/// Unknown commands succeed with empty output.
#[derive(Debug, Default)]
pub struct MockExecutor {
    outputs: HashMap<String, Result<CommandOutput, ExecError>>,
    scripts: HashMap<String, String>,
    programs: Vec<String>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, key: &str, output: CommandOutput) -> Self {
        self.outputs.insert(key.to_string(), Ok(output));
        self
    }

    pub fn fail(mut self, key: &str, code: i32, stderr: &str) -> Self {
        self.outputs.insert(
            key.to_string(),
            Ok(CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        );
        self
    }

    /// Streams of `key` run this `sh` script instead of the real command.
    pub fn script(mut self, key: &str, script: &str) -> Self {
        self.scripts.insert(key.to_string(), script.to_string());
        self
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.programs.push(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn called(&self, program: &str) -> bool {
        self.calls().iter().any(|c| c.program == program)
    }

    fn keys(spec: &CommandSpec) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(first) = spec.args.first() {
            keys.push(format!("{} {}", spec.program, first));
        }
        keys.push(spec.program.clone());
        keys
    }

    fn record(&self, spec: &CommandSpec) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
    }
}

impl Executor for MockExecutor {
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.record(spec);
        Self::keys(spec)
            .iter()
            .find_map(|key| self.outputs.get(key).cloned())
            .unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }

    fn stream(&self, id: StreamId, spec: &CommandSpec) -> io::Result<ProcessHandle> {
        self.record(spec);
        let script = Self::keys(spec)
            .iter()
            .find_map(|key| self.scripts.get(key).cloned())
            .unwrap_or_else(|| "true".to_string());
        // The script sees the original arguments as $1.. and the original
        // environment and directory.
        let mut stand_in = CommandSpec::new("sh")
            .args(["-c", script.as_str(), spec.program.as_str()])
            .args(spec.args.iter().cloned());
        stand_in.env = spec.env.clone();
        stand_in.current_dir = spec.current_dir.clone();
        process::spawn(id, &stand_in)
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        self.programs
            .iter()
            .any(|p| p == program)
            .then(|| PathBuf::from("/usr/bin").join(program))
    }
}
