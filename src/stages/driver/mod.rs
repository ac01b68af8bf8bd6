mod service;

pub use service::DriverService;

use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::{prelude::*, Frame};
use tracing::{debug, info, warn};

use super::{track_resize, Stage, Viewport};
use crate::bus::Command;
use crate::keys::KeyMap;
use crate::message::{Message, StageId};
use crate::navigator::Navigator;
use crate::process::{self, ProcessError, ProcessEvent, Step, StreamId};
use crate::ui::widgets::{draw_log, draw_panel, LogBuffer, Spinner, StatusBarState};
use crate::ui::Theme;

const INSTALL_FAILED: &str = "installation failed or was cancelled by the user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Confirmation,
    Installing,
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub enum DriverMsg {
    Process(ProcessEvent),
}

fn wrap(event: ProcessEvent) -> Message {
    Message::Driver(DriverMsg::Process(event))
}

#[derive(Debug, Clone)]
pub struct DriverStage {
    service: Arc<DriverService>,
    keys: KeyMap,
    nav: Navigator<DriverPhase>,
    viewport: Viewport,
    spinner: Spinner,
    install: bool,
    stream: Option<StreamId>,
    log: LogBuffer,
    error: Option<ProcessError>,
}

impl DriverStage {
    pub fn new(service: Arc<DriverService>) -> Self {
        Self {
            service,
            keys: KeyMap::default(),
            nav: Navigator::new(DriverPhase::Confirmation),
            viewport: Viewport::default(),
            spinner: Spinner::default(),
            install: true,
            stream: None,
            log: LogBuffer::default(),
            error: None,
        }
    }

    pub fn phase(&self) -> DriverPhase {
        self.nav.current()
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    fn start_install(&mut self) -> Command {
        self.nav.push(DriverPhase::Installing);
        self.log.clear();
        let spec = self.service.install_spec();
        self.log.push(format!("$ {}", spec.display()));
        let (id, cmd) = process::launch(self.service.executor(), spec, wrap);
        info!("Driver install started as process {}", id);
        self.stream = Some(id);
        cmd
    }

    fn handle_process(&mut self, event: &ProcessEvent) -> Command {
        let active = match self.phase() {
            DriverPhase::Installing => self.stream,
            _ => None,
        };
        let (step, cmd) = process::advance(active, event, wrap);
        match step {
            Step::Started | Step::Stale => {}
            Step::Line(line) => self.log.push(line),
            Step::Exited(result) => {
                self.stream = None;
                match result {
                    Ok(()) => self.nav.push(DriverPhase::Success),
                    Err(e) => {
                        warn!("Driver install failed: {}", e);
                        self.error = Some(e);
                        self.nav.push(DriverPhase::Error);
                    }
                }
            }
        }
        cmd
    }

    fn handle_key(&mut self, key: &KeyEvent) -> Command {
        match self.phase() {
            DriverPhase::Confirmation => {
                if self.keys.up.matches(key) || self.keys.down.matches(key) {
                    self.install = !self.install;
                    Command::none()
                } else if self.keys.enter.matches(key) && self.install {
                    self.start_install()
                } else if self.keys.enter.matches(key) || self.keys.back.matches(key) {
                    Command::message(Message::StageCancelled(StageId::Driver))
                } else {
                    Command::none()
                }
            }
            DriverPhase::Success if self.leaves(key) => Command::message(Message::StageFinished {
                stage: StageId::Driver,
                payload: None,
            }),
            DriverPhase::Error if self.leaves(key) => {
                Command::message(Message::StageCancelled(StageId::Driver))
            }
            _ => Command::none(),
        }
    }

    fn leaves(&self, key: &KeyEvent) -> bool {
        self.keys.enter.matches(key) || self.keys.back.matches(key)
    }

    fn confirmation_lines(&self, theme: &Theme) -> Vec<Line<'static>> {
        let option = |label: &str, selected: bool| {
            if selected {
                Line::styled(format!("[•] {label}"), theme.title_style())
            } else {
                Line::from(format!("[ ] {label}"))
            }
        };
        vec![
            Line::from("We detected an NVIDIA GPU."),
            Line::from(""),
            Line::from("Do you want to install the proprietary drivers?"),
            Line::styled(
                format!("(This will install {})", self.service.packages().join(", ")),
                theme.muted_style(),
            ),
            Line::from(""),
            option("Yes", self.install),
            option("No", !self.install),
            Line::from(""),
            Line::styled(
                "Use ↑/↓ to select. Press Enter to confirm, Esc to go back.",
                theme.muted_style(),
            ),
        ]
    }
}

impl Stage for DriverStage {
    fn id(&self) -> StageId {
        StageId::Driver
    }

    fn init(&mut self) -> Command {
        if let Some(id) = self.stream.take() {
            debug!("Leaving process {} to drain in the background", id);
        }
        self.nav.reset(DriverPhase::Confirmation);
        self.install = true;
        self.error = None;
        self.log.clear();
        Command::none()
    }

    fn update(&mut self, msg: &Message) -> Command {
        if track_resize(&mut self.viewport, msg) {
            return Command::none();
        }
        match msg {
            Message::Tick => {
                if self.phase() == DriverPhase::Installing {
                    self.spinner.tick();
                }
                Command::none()
            }
            Message::Key(key) => self.handle_key(key),
            Message::Driver(DriverMsg::Process(event)) => self.handle_process(event),
            _ => Command::none(),
        }
    }

    fn view(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        match self.phase() {
            DriverPhase::Confirmation => {
                draw_panel(frame, area, "NVIDIA Drivers", self.confirmation_lines(theme), theme);
            }
            DriverPhase::Installing => {
                let [status, log] = Layout::vertical([Constraint::Length(2), Constraint::Min(3)])
                    .areas(area);
                frame.render_widget(
                    Line::from(format!("{} Installing NVIDIA drivers...", self.spinner.glyph())),
                    status,
                );
                draw_log(frame, log, "Output", &self.log, theme);
            }
            DriverPhase::Success => draw_panel(
                frame,
                area,
                "NVIDIA Drivers",
                vec![
                    Line::styled("✓ Drivers installed successfully!", theme.success_style()),
                    Line::from(""),
                    Line::from("A reboot is required for the changes to take effect."),
                    Line::from(""),
                    Line::styled("Press Enter to return to the main menu.", theme.muted_style()),
                ],
                theme,
            ),
            DriverPhase::Error => {
                let detail = self
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                draw_panel(
                    frame,
                    area,
                    "NVIDIA Drivers",
                    vec![
                        Line::styled(format!("✗ {INSTALL_FAILED}"), theme.error_style()),
                        Line::styled(detail, theme.muted_style()),
                        Line::from(""),
                        Line::styled(
                            "Press Enter to return to the main menu.",
                            theme.muted_style(),
                        ),
                    ],
                    theme,
                );
            }
        }
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn status_bar(&self) -> StatusBarState {
        match self.phase() {
            DriverPhase::Confirmation => StatusBarState::from_bindings(
                &[self.keys.up, self.keys.down, self.keys.back],
                &[self.keys.enter],
            ),
            DriverPhase::Installing => StatusBarState::busy(),
            DriverPhase::Success | DriverPhase::Error => {
                StatusBarState::from_bindings(&[], &[self.keys.enter])
            }
        }
    }

    fn snapshot(&self) -> Box<dyn Stage> {
        Box::new(self.clone())
    }
}
