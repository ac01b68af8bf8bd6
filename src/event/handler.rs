use crossterm::event::{self, KeyEventKind};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::Message;

/// Polls the terminal on a dedicated thread and feeds keys, resizes and
/// ticks into the bus.
pub struct EventHandler {
    _thread: std::thread::JoinHandle<()>,
}

impl EventHandler {
    pub fn new(tx: mpsc::UnboundedSender<Message>, tick_rate: Duration) -> Self {
        let thread = std::thread::spawn(move || {
            loop {
                let msg = if event::poll(tick_rate).unwrap_or(false) {
                    match event::read() {
                        Ok(event::Event::Key(key)) if key.kind == KeyEventKind::Press => {
                            Message::Key(key)
                        }
                        Ok(event::Event::Resize(width, height)) => {
                            Message::Resize { width, height }
                        }
                        _ => continue,
                    }
                } else {
                    Message::Tick
                };

                if tx.send(msg).is_err() {
                    debug!("Event receiver dropped, stopping input thread");
                    break;
                }
            }
        });

        Self { _thread: thread }
    }
}
