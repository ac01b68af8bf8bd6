//! Deferred commands and the scheduler that runs them.
//!
//! A [`Command`] is a future that resolves to exactly one [`Message`]. The
//! update loop never awaits one directly: commands are handed to the [`Bus`],
//! which spawns each as its own task and feeds the result back through a
//! channel drained by the loop.

mod join;

pub use join::join_all;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::message::Message;
use crate::shield;

pub type Task = Pin<Box<dyn Future<Output = Message> + Send + 'static>>;

#[must_use]
pub enum Command {
    None,
    Task(Task),
    Batch(Vec<Command>),
}

impl Command {
    pub fn none() -> Self {
        Command::None
    }

    pub fn perform<F>(future: F) -> Self
    where
        F: Future<Output = Message> + Send + 'static,
    {
        Command::Task(Box::pin(future))
    }

    /// A command that resolves immediately to `msg`.
    pub fn message(msg: Message) -> Self {
        Self::perform(async move { msg })
    }

    /// Runs `f` on the blocking pool. Used for the executor calls, which
    /// shell out synchronously.
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        Self::perform(async move {
            match shield::spawn_blocking("blocking", f).await {
                Ok(msg) => msg,
                Err(reason) => Message::CommandFailed { reason },
            }
        })
    }

    /// Fires every command at once. Nested batches are flattened and empty
    /// commands dropped.
    pub fn batch<I>(commands: I) -> Self
    where
        I: IntoIterator<Item = Command>,
    {
        let mut tasks: Vec<Command> = commands
            .into_iter()
            .flat_map(|c| c.into_tasks())
            .map(Command::Task)
            .collect();
        match tasks.len() {
            0 => Command::None,
            1 => tasks.pop().unwrap_or(Command::None),
            _ => Command::Batch(tasks),
        }
    }

    pub fn is_none(&self) -> bool {
        self.task_count() == 0
    }

    pub fn task_count(&self) -> usize {
        match self {
            Command::None => 0,
            Command::Task(_) => 1,
            Command::Batch(commands) => commands.iter().map(Command::task_count).sum(),
        }
    }

    pub fn into_tasks(self) -> Vec<Task> {
        match self {
            Command::None => Vec::new(),
            Command::Task(task) => vec![task],
            Command::Batch(commands) => {
                commands.into_iter().flat_map(Command::into_tasks).collect()
            }
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::None => write!(f, "Command::None"),
            Command::Task(_) => write!(f, "Command::Task"),
            Command::Batch(commands) => write!(f, "Command::Batch({})", commands.len()),
        }
    }
}

/// Runs commands concurrently and queues their messages for the update loop.
pub struct Bus {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Producer handle for input sources outside the bus (the terminal
    /// event thread).
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.tx.clone()
    }

    pub fn schedule(&self, command: Command) {
        let tasks = command.into_tasks();
        if !tasks.is_empty() {
            debug!("Scheduling {} task(s)", tasks.len());
        }
        for task in tasks {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let msg = match AssertUnwindSafe(shield::Contained::new(task))
                    .catch_unwind()
                    .await
                {
                    Ok(msg) => msg,
                    Err(payload) => {
                        let reason = shield::panic_message(&*payload);
                        shield::log_task_panic("async", &reason);
                        Message::CommandFailed { reason }
                    }
                };
                if tx.send(msg).is_err() {
                    error!("Update loop gone, dropping command result");
                }
            });
        }
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StageId;

    #[test]
    fn test_batch_flattens_and_drops_none() {
        let cmd = Command::batch([
            Command::none(),
            Command::message(Message::Tick),
            Command::batch([Command::message(Message::Quit), Command::none()]),
        ]);
        assert_eq!(cmd.task_count(), 2);
        assert!(matches!(cmd, Command::Batch(_)));
    }

    #[test]
    fn test_batch_of_one_is_a_single_task() {
        let cmd = Command::batch([Command::none(), Command::message(Message::Tick)]);
        assert!(matches!(cmd, Command::Task(_)));
    }

    #[test]
    fn test_empty_batch_is_none() {
        assert!(Command::batch(Vec::new()).is_none());
        assert!(Command::batch([Command::none(), Command::none()]).is_none());
    }

    #[tokio::test]
    async fn test_scheduled_batch_delivers_every_message() {
        let mut bus = Bus::new();
        bus.schedule(Command::batch([
            Command::message(Message::StageSelected(StageId::Repo)),
            Command::message(Message::StageCancelled(StageId::Driver)),
            Command::blocking(|| Message::Tick),
        ]));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(bus.next().await.unwrap());
        }
        assert!(seen.iter().any(|m| matches!(m, Message::StageSelected(StageId::Repo))));
        assert!(seen.iter().any(|m| matches!(m, Message::StageCancelled(StageId::Driver))));
        assert!(seen.iter().any(|m| matches!(m, Message::Tick)));
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failure_message() {
        shield::install_panic_hook(|| {});
        let mut bus = Bus::new();
        bus.schedule(Command::perform(async {
            panic!("task exploded");
        }));
        match bus.next().await.unwrap() {
            Message::CommandFailed { reason } => assert!(reason.contains("task exploded")),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_blocking_task_becomes_failure_message() {
        shield::install_panic_hook(|| {});
        let (logs, _guard) = shield::testing::capture_logs();
        let mut bus = Bus::new();
        bus.schedule(Command::blocking(|| panic!("blocking exploded")));
        match bus.next().await.unwrap() {
            Message::CommandFailed { reason } => assert!(reason.contains("blocking exploded")),
            other => panic!("unexpected message {other:?}"),
        }

        let logged = logs.contents();
        assert_eq!(logged.matches("Contained panic in").count(), 1, "{logged}");
        assert!(!logged.contains("location=unknown"), "{logged}");
        assert!(logged.contains("bus/mod.rs"), "{logged}");
    }
}
