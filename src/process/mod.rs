//! Streaming subprocess pipeline.
//!
//! [`launch`] spawns a child with piped stdout and stderr. One reader task per
//! pipe forwards lines into a shared bounded channel and a third task closes
//! the channel once both readers are done. The owning stage then pulls one
//! line per message with [`Stream::read_next`]. When the channel reports
//! closed the child is waited on, once, and the exit status becomes the final
//! [`ProcessEvent::Exited`].

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::bus::Command;
use crate::message::Message;
use crate::system::{CommandSpec, Executor};

/// Capacity of the per-process line channel.
pub const LINE_CHANNEL_CAPACITY: usize = 128;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} exited with code {code:?}")]
    Exit { program: String, code: Option<i32> },

    #[error("failed to wait for {program}: {reason}")]
    Wait { program: String, reason: String },

    #[error("process {0} was already reaped")]
    AlreadyReaped(StreamId),
}

/// Owns one child process and the receiving end of its line channel.
pub struct ProcessHandle {
    id: StreamId,
    program: String,
    lines: Mutex<mpsc::Receiver<String>>,
    child: Mutex<Option<Child>>,
}

impl ProcessHandle {
    /// Waits on the child. Only reached after the channel has closed, which
    /// means both pipes hit EOF.
    async fn wait(&self) -> Result<(), ProcessError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Err(ProcessError::AlreadyReaped(self.id));
        };
        let status = child.wait().await.map_err(|e| ProcessError::Wait {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        info!("Process {} ({}) exited with {}", self.id, self.program, status);
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Exit {
                program: self.program.clone(),
                code: status.code(),
            })
        }
    }
}

/// Spawns `spec` and starts the reader tasks. Must run inside the runtime.
pub fn spawn(id: StreamId, spec: &CommandSpec) -> io::Result<ProcessHandle> {
    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;
    info!("Started process {} (pid {:?}): {}", id, child.id(), spec.display());

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let stdout = tokio::spawn(forward_lines(child.stdout.take(), tx.clone()));
    let stderr = tokio::spawn(forward_lines(child.stderr.take(), tx.clone()));
    tokio::spawn(async move {
        let _ = stdout.await;
        let _ = stderr.await;
        drop(tx);
        debug!("Line channel for process {} closed", id);
    });

    Ok(ProcessHandle {
        id,
        program: spec.program.clone(),
        lines: Mutex::new(rx),
        child: Mutex::new(Some(child)),
    })
}

async fn forward_lines<R>(reader: Option<R>, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Reading process output failed: {}", e);
                break;
            }
        }
    }
}

/// Cheap handle to a running process, carried inside messages.
#[derive(Clone)]
pub struct Stream(Arc<ProcessHandle>);

impl Stream {
    pub fn id(&self) -> StreamId {
        self.0.id
    }

    /// One pull: resolves to the next line, or to the exit once the channel
    /// is drained.
    pub fn read_next(&self, wrap: fn(ProcessEvent) -> Message) -> Command {
        let stream = self.clone();
        Command::perform(async move { wrap(stream.next_event().await) })
    }

    async fn next_event(self) -> ProcessEvent {
        let line = self.0.lines.lock().await.recv().await;
        match line {
            Some(line) => ProcessEvent::Line { stream: self, line },
            None => ProcessEvent::Exited {
                id: self.0.id,
                result: self.0.wait().await,
            },
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({} {})", self.0.id, self.0.program)
    }
}

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Started(Stream),
    Line { stream: Stream, line: String },
    Exited {
        id: StreamId,
        result: Result<(), ProcessError>,
    },
}

impl ProcessEvent {
    pub fn id(&self) -> StreamId {
        match self {
            ProcessEvent::Started(stream) => stream.id(),
            ProcessEvent::Line { stream, .. } => stream.id(),
            ProcessEvent::Exited { id, .. } => *id,
        }
    }
}

/// Starts `spec` through `executor`. The returned id is known before the
/// process exists so the caller can recognise its events.
pub fn launch(
    executor: Arc<dyn Executor>,
    spec: CommandSpec,
    wrap: fn(ProcessEvent) -> Message,
) -> (StreamId, Command) {
    let id = StreamId::next();
    let cmd = Command::perform(async move {
        let event = match executor.stream(id, &spec) {
            Ok(handle) => ProcessEvent::Started(Stream(Arc::new(handle))),
            Err(e) => {
                warn!("Could not start {}: {}", spec.display(), e);
                ProcessEvent::Exited {
                    id,
                    result: Err(ProcessError::Spawn {
                        program: spec.program.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
        };
        wrap(event)
    });
    (id, cmd)
}

/// What a stage should do with one pipeline event.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Started,
    Line(String),
    Exited(Result<(), ProcessError>),
    /// Event for a stream the stage no longer follows.
    Stale,
}

/// Drives the pull loop for a stage following `active`.
///
/// Every started or line event schedules the next read, including events of
/// streams the stage has abandoned, so those still drain and get reaped.
pub fn advance(
    active: Option<StreamId>,
    event: &ProcessEvent,
    wrap: fn(ProcessEvent) -> Message,
) -> (Step, Command) {
    let current = active == Some(event.id());
    match event {
        ProcessEvent::Started(stream) => {
            let step = if current { Step::Started } else { Step::Stale };
            (step, stream.read_next(wrap))
        }
        ProcessEvent::Line { stream, line } => {
            let step = if current {
                Step::Line(line.clone())
            } else {
                Step::Stale
            };
            (step, stream.read_next(wrap))
        }
        ProcessEvent::Exited { id, result } => {
            if current {
                (Step::Exited(result.clone()), Command::none())
            } else {
                debug!("Abandoned process {} finished: {:?}", id, result);
                (Step::Stale, Command::none())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::driver::DriverMsg;
    use crate::system::LiveExecutor;

    fn wrap(event: ProcessEvent) -> Message {
        Message::Driver(DriverMsg::Process(event))
    }

    fn unwrap_event(msg: Message) -> ProcessEvent {
        match msg {
            Message::Driver(DriverMsg::Process(event)) => event,
            other => panic!("unexpected message {other:?}"),
        }
    }

    async fn run(cmd: Command) -> ProcessEvent {
        let mut tasks = cmd.into_tasks();
        assert_eq!(tasks.len(), 1);
        unwrap_event(tasks.remove(0).await)
    }

    /// Pulls the stream to completion the way a stage would.
    async fn drain(script: &str) -> (Vec<String>, Vec<Result<(), ProcessError>>, Stream) {
        let spec = CommandSpec::new("sh").args(["-c", script]);
        let (id, cmd) = launch(Arc::new(LiveExecutor), spec, wrap);

        let stream = match run(cmd).await {
            ProcessEvent::Started(stream) => stream,
            other => panic!("expected start, got {other:?}"),
        };
        assert_eq!(stream.id(), id);

        let mut lines = Vec::new();
        let mut exits = Vec::new();
        let mut next = stream.read_next(wrap);
        loop {
            let event = run(next).await;
            let (step, cmd) = advance(Some(id), &event, wrap);
            match step {
                Step::Line(line) => lines.push(line),
                Step::Exited(result) => {
                    exits.push(result);
                    assert!(cmd.is_none());
                    break;
                }
                other => panic!("unexpected step {other:?}"),
            }
            next = cmd;
        }
        (lines, exits, stream)
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_lines_then_single_success() {
        let (lines, exits, _) =
            drain("echo out1; echo err1 >&2; echo out2; echo err2 >&2; echo out3").await;
        assert_eq!(lines.len(), 5);
        let stdout: Vec<_> = lines.iter().filter(|l| l.starts_with("out")).collect();
        let stderr: Vec<_> = lines.iter().filter(|l| l.starts_with("err")).collect();
        // Order within each pipe is preserved.
        assert_eq!(stdout, ["out1", "out2", "out3"]);
        assert_eq!(stderr, ["err1", "err2"]);
        assert_eq!(exits, vec![Ok(())]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_failure_after_lines() {
        let (lines, exits, _) = drain("echo a; echo b >&2; exit 3").await;
        assert_eq!(lines.len(), 2);
        assert_eq!(
            exits,
            vec![Err(ProcessError::Exit {
                program: "sh".to_string(),
                code: Some(3)
            })]
        );
    }

    #[tokio::test]
    async fn test_output_larger_than_channel_and_pipe_buffers() {
        let (lines, exits, _) = drain("seq 1 5000; seq 1 3000 >&2").await;
        assert_eq!(lines.len(), 8000);
        assert_eq!(exits, vec![Ok(())]);
    }

    #[tokio::test]
    async fn test_second_read_after_exit_does_not_reap_twice() {
        let (_, exits, stream) = drain("true").await;
        assert_eq!(exits, vec![Ok(())]);
        match run(stream.read_next(wrap)).await {
            ProcessEvent::Exited { result, .. } => {
                assert_eq!(result, Err(ProcessError::AlreadyReaped(stream.id())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_exit_event() {
        let spec = CommandSpec::new("archsetup-test-no-such-binary");
        let (id, cmd) = launch(Arc::new(LiveExecutor), spec, wrap);
        match run(cmd).await {
            ProcessEvent::Exited { id: got, result } => {
                assert_eq!(got, id);
                assert!(matches!(result, Err(ProcessError::Spawn { .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_stream_is_still_drained() {
        let spec = CommandSpec::new("sh").args(["-c", "echo one; echo two"]);
        let (_, cmd) = launch(Arc::new(LiveExecutor), spec, wrap);
        let followed = Some(StreamId::next());

        let mut event = run(cmd).await;
        let mut stale_reads = 0;
        loop {
            let (step, next) = advance(followed, &event, wrap);
            assert_eq!(step, Step::Stale);
            if next.is_none() {
                assert!(matches!(event, ProcessEvent::Exited { result: Ok(()), .. }));
                break;
            }
            stale_reads += 1;
            event = run(next).await;
        }
        // Started plus two lines each scheduled another read.
        assert_eq!(stale_reads, 3);
    }
}
