//! Panic containment around stage lifecycle calls and bus tasks.
//!
//! A panic inside a shielded call is caught, logged once at error level with
//! its source location and backtrace, and turned into a no-op. For `init` and
//! `update` the stage is restored from a snapshot taken before the call, so a
//! half-applied transition never survives.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use ratatui::Frame;
use ratatui::layout::Rect;
use tracing::error;

use crate::bus::Command;
use crate::message::{Message, StageId};
use crate::stages::Stage;
use crate::ui::Theme;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

#[derive(Debug)]
struct PanicReport {
    location: String,
    backtrace: String,
}

/// Marks the current thread as running shielded code until dropped.
pub struct ShieldGuard {
    _private: (),
}

pub fn enter() -> ShieldGuard {
    DEPTH.with(|depth| depth.set(depth.get() + 1));
    ShieldGuard { _private: () }
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn is_shielded() -> bool {
    DEPTH.with(|depth| depth.get() > 0)
}

/// Installs the process panic hook once.
///
/// Shielded panics only record their location and backtrace for the shield to
/// log. Any other panic runs `on_unshielded` (the binary restores the
/// terminal there) and then the previous hook.
pub fn install_panic_hook<F>(on_unshielded: F)
where
    F: Fn() + Send + Sync + 'static,
{
    HOOK.call_once(|| {
        let original = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if is_shielded() {
                let location = info
                    .location()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let report = PanicReport {
                    location,
                    backtrace: Backtrace::force_capture().to_string(),
                };
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
                return;
            }
            on_unshielded();
            original(info);
        }));
    });
}

fn take_report() -> PanicReport {
    LAST_PANIC
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| PanicReport {
            location: "unknown".to_string(),
            backtrace: Backtrace::force_capture().to_string(),
        })
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn log_report(kind: &str, reason: &str, report: &PanicReport) {
    error!(
        kind,
        location = %report.location,
        "Contained panic in {} command task: {}\n{}",
        kind,
        reason,
        report.backtrace
    );
}

/// Logs a task panic caught on the thread that raised it.
pub(crate) fn log_task_panic(kind: &str, reason: &str) {
    let report = take_report();
    log_report(kind, reason, &report);
}

/// A panic caught on one thread, carried to another to be logged.
struct Caught {
    reason: String,
    report: PanicReport,
}

/// Runs `f` on the blocking pool under the shield. The hook's report is
/// collected on the pool thread, so the logged location is the panic site.
/// A panic is logged once and comes back as its message.
pub async fn spawn_blocking<T, F>(kind: &'static str, f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let _guard = enter();
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Caught {
            reason: panic_message(&*payload),
            report: take_report(),
        })
    })
    .await;
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(caught)) => {
            log_report(kind, &caught.reason, &caught.report);
            Err(caught.reason)
        }
        Err(e) => Err(e.to_string()),
    }
}

fn log_stage_panic(stage: StageId, call: &'static str, payload: &(dyn Any + Send)) {
    let reason = panic_message(payload);
    let report = take_report();
    error!(
        stage = stage.short_name(),
        call,
        location = %report.location,
        "Contained panic in {}::{}: {}\n{}",
        stage.short_name(),
        call,
        reason,
        report.backtrace
    );
}

fn guard_mut<F>(stage: &mut Box<dyn Stage>, call: &'static str, f: F) -> Command
where
    F: FnOnce(&mut dyn Stage) -> Command,
{
    let id = stage.id();
    let snapshot = stage.snapshot();
    let result = {
        let _guard = enter();
        panic::catch_unwind(AssertUnwindSafe(|| f(stage.as_mut())))
    };
    match result {
        Ok(cmd) => cmd,
        Err(payload) => {
            *stage = snapshot;
            log_stage_panic(id, call, &*payload);
            Command::none()
        }
    }
}

pub fn init(stage: &mut Box<dyn Stage>) -> Command {
    guard_mut(stage, "init", |s| s.init())
}

pub fn update(stage: &mut Box<dyn Stage>, msg: &Message) -> Command {
    guard_mut(stage, "update", |s| s.update(msg))
}

pub fn view(stage: &dyn Stage, frame: &mut Frame, area: Rect, theme: &Theme) {
    let id = stage.id();
    let result = {
        let _guard = enter();
        panic::catch_unwind(AssertUnwindSafe(|| stage.view(frame, area, theme)))
    };
    if let Err(payload) = result {
        log_stage_panic(id, "view", &*payload);
    }
}

/// Future wrapper that marks every poll as shielded, so panics inside bus
/// tasks are recorded for the log instead of tearing down the terminal.
pub struct Contained<F> {
    inner: F,
}

impl<F> Contained<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: Future + Unpin> Future for Contained<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = enter();
        Pin::new(&mut self.get_mut().inner).poll(cx)
    }
}
