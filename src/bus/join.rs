use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use super::Command;
use crate::message::Message;
use crate::shield;

type Combine<T> = Box<dyn FnOnce(Vec<T>) -> Message + Send>;

/// Shared state for one fan-out. The task that takes `pending` to zero
/// combines the slots and sends the only message.
struct JoinBarrier<T> {
    pending: AtomicUsize,
    slots: Mutex<Vec<Option<T>>>,
    finish: Mutex<Option<(Combine<T>, oneshot::Sender<Message>)>>,
}

impl<T> JoinBarrier<T> {
    fn complete(&self, index: usize, value: T) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots[index] = Some(value);
        }

        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let results: Vec<T> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .flatten()
            .collect();
        let finish = self
            .finish
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((combine, tx)) = finish {
            debug!("Fan-out complete with {} result(s)", results.len());
            let _ = tx.send(combine(results));
        }
    }
}

/// Runs every task concurrently and resolves to `combine(results)` once the
/// last one completes. Results keep the order of `tasks`, whatever order the
/// tasks finish in.
pub fn join_all<T, F>(
    tasks: Vec<Pin<Box<dyn Future<Output = T> + Send>>>,
    combine: F,
) -> Command
where
    T: Send + 'static,
    F: FnOnce(Vec<T>) -> Message + Send + 'static,
{
    Command::perform(async move {
        if tasks.is_empty() {
            return combine(Vec::new());
        }

        let (tx, rx) = oneshot::channel();
        let barrier = Arc::new(JoinBarrier {
            pending: AtomicUsize::new(tasks.len()),
            slots: Mutex::new((0..tasks.len()).map(|_| None).collect()),
            finish: Mutex::new(Some((Box::new(combine) as Combine<T>, tx))),
        });

        for (index, task) in tasks.into_iter().enumerate() {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                match AssertUnwindSafe(shield::Contained::new(task))
                    .catch_unwind()
                    .await
                {
                    Ok(value) => barrier.complete(index, value),
                    Err(payload) => {
                        let reason = shield::panic_message(&*payload);
                        shield::log_task_panic("fan-out", &reason);
                    }
                }
            });
        }
        drop(barrier);

        // The sender only disappears without sending if a task died.
        rx.await.unwrap_or_else(|_| Message::CommandFailed {
            reason: "fan-out task ended before reporting".to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type Check = Pin<Box<dyn Future<Output = &'static str> + Send>>;

    fn gated(label: &'static str, gate: oneshot::Receiver<()>) -> Check {
        Box::pin(async move {
            let _ = gate.await;
            label
        })
    }

    async fn run_in_order(release_first: usize) -> (Vec<Message>, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let (remote_tx, remote_rx) = oneshot::channel();
        let (dest_tx, dest_rx) = oneshot::channel();

        let counter = Arc::clone(&calls);
        let cmd = join_all(
            vec![gated("remote", remote_rx), gated("dest", dest_rx)],
            move |results| {
                counter.fetch_add(1, Ordering::SeqCst);
                Message::CommandFailed {
                    reason: results.join(","),
                }
            },
        );

        let mut tasks = cmd.into_tasks();
        assert_eq!(tasks.len(), 1);
        let handle = tokio::spawn(tasks.remove(0));

        tokio::task::yield_now().await;
        if release_first == 0 {
            remote_tx.send(()).unwrap();
            tokio::task::yield_now().await;
            dest_tx.send(()).unwrap();
        } else {
            dest_tx.send(()).unwrap();
            tokio::task::yield_now().await;
            remote_tx.send(()).unwrap();
        }

        let msg = handle.await.unwrap();
        (vec![msg], calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_combined_once_when_first_check_finishes_first() {
        let (messages, calls) = run_in_order(0).await;
        assert_eq!(calls, 1);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::CommandFailed { reason } => assert_eq!(reason, "remote,dest"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_combined_once_when_second_check_finishes_first() {
        let (messages, calls) = run_in_order(1).await;
        assert_eq!(calls, 1);
        match &messages[0] {
            Message::CommandFailed { reason } => assert_eq!(reason, "remote,dest"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_tasks_combines_immediately() {
        let cmd = join_all(Vec::<Pin<Box<dyn Future<Output = u8> + Send>>>::new(), |r| {
            Message::CommandFailed {
                reason: format!("{}", r.len()),
            }
        });
        let msg = cmd.into_tasks().remove(0).await;
        assert!(matches!(msg, Message::CommandFailed { reason } if reason == "0"));
    }

    #[tokio::test]
    async fn test_panicking_check_is_contained_and_logged() {
        let restores = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&restores);
        shield::install_panic_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (logs, _guard) = shield::testing::capture_logs();

        let exploding: Check = Box::pin(async { panic!("check exploded") });
        let fine: Check = Box::pin(async { "fine" });
        let mut bus = super::super::Bus::new();
        bus.schedule(join_all(vec![fine, exploding], |results| {
            Message::CommandFailed {
                reason: results.join(","),
            }
        }));

        match bus.next().await.unwrap() {
            Message::CommandFailed { reason } => {
                assert_eq!(reason, "fan-out task ended before reporting")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(restores.load(Ordering::SeqCst), 0);
        let logged = logs.contents();
        assert_eq!(logged.matches("Contained panic in").count(), 1, "{logged}");
        assert!(logged.contains("check exploded"));
        assert!(logged.contains("join.rs"));
    }
}
