mod service;

pub use service::{combine, Destination, RepoError, RepoService, ValidationOutcome};

use std::path::PathBuf;
use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::{prelude::*, Frame};
use tracing::{debug, info};

use super::{track_resize, Stage, Viewport};
use crate::bus::Command;
use crate::keys::KeyMap;
use crate::message::{Message, StageId, StagePayload, StatusUpdate};
use crate::navigator::Navigator;
use crate::ui::widgets::{draw_panel, Spinner, StatusBarState};
use crate::ui::{InputBuffer, Theme};

const REPO_LIMIT: usize = 100;
const DEST_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoPhase {
    Input,
    Validating,
    DirExists,
    Confirmation,
    Cloning,
    CloneComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Repo,
    Destination,
}

#[derive(Debug, Clone)]
pub enum RepoMsg {
    Validated(ValidationOutcome),
    Cloned(Result<(), RepoError>),
}

#[derive(Debug, Clone)]
pub struct RepoStage {
    service: Arc<RepoService>,
    keys: KeyMap,
    nav: Navigator<RepoPhase>,
    viewport: Viewport,
    spinner: Spinner,
    repo: InputBuffer,
    destination: InputBuffer,
    focus: Field,
    error: Option<RepoError>,
}

impl RepoStage {
    pub fn new(service: Arc<RepoService>, default_destination: PathBuf) -> Self {
        let default_destination = default_destination.to_string_lossy().into_owned();
        let mut destination = InputBuffer::new(&default_destination, DEST_LIMIT);
        destination.set(&default_destination);
        Self {
            service,
            keys: KeyMap::default().input_nav(),
            nav: Navigator::new(RepoPhase::Input),
            viewport: Viewport::default(),
            spinner: Spinner::default(),
            repo: InputBuffer::new("username/dotfiles-repo", REPO_LIMIT),
            destination,
            focus: Field::Repo,
            error: None,
        }
    }

    pub fn phase(&self) -> RepoPhase {
        self.nav.current()
    }

    pub fn error(&self) -> Option<&RepoError> {
        self.error.as_ref()
    }

    pub fn repo_value(&self) -> &str {
        self.repo.content()
    }

    fn repo_path(&self) -> String {
        self.repo.content().trim().to_string()
    }

    fn dest_path(&self) -> String {
        self.destination.content().trim().to_string()
    }

    fn submit(&mut self) -> Command {
        let repo = self.repo_path();
        let dest = self.dest_path();
        if repo.is_empty() || dest.is_empty() || repo.ends_with('/') {
            self.error = Some(RepoError::IncompleteInput);
            return Command::none();
        }
        self.error = None;
        self.nav.push(RepoPhase::Validating);
        debug!("Validating {} -> {}", repo, dest);
        self.service.validate(repo, PathBuf::from(dest))
    }

    fn start_clone(&mut self) -> Command {
        self.nav.push(RepoPhase::Cloning);
        let service = Arc::clone(&self.service);
        let repo = self.repo_path();
        let dest = PathBuf::from(self.dest_path());
        Command::blocking(move || Message::Repo(RepoMsg::Cloned(service.clone_repo(&repo, &dest))))
    }

    fn finish(&self) -> Command {
        Command::message(Message::StageFinished {
            stage: StageId::Repo,
            payload: Some(StagePayload::RepoPath(PathBuf::from(self.dest_path()))),
        })
    }

    fn handle_input_key(&mut self, key: &KeyEvent) -> Command {
        if self.keys.enter.matches(key) {
            return self.submit();
        }
        if self.keys.back.matches(key) {
            return Command::message(Message::StageCancelled(StageId::Repo));
        }
        if self.keys.tab.matches(key) || self.keys.shift_tab.matches(key) {
            self.focus = match self.focus {
                Field::Repo => Field::Destination,
                Field::Destination => Field::Repo,
            };
        } else if self.keys.up.matches(key) {
            self.focus = Field::Repo;
        } else if self.keys.down.matches(key) {
            self.focus = Field::Destination;
        } else {
            let input = match self.focus {
                Field::Repo => &mut self.repo,
                Field::Destination => &mut self.destination,
            };
            if input.handle_key(key) {
                self.error = None;
            }
        }
        Command::none()
    }

    fn handle_key(&mut self, key: &KeyEvent) -> Command {
        match self.phase() {
            RepoPhase::Input => self.handle_input_key(key),
            RepoPhase::Confirmation => {
                if self.keys.enter.matches(key) {
                    self.start_clone()
                } else {
                    if self.keys.back.matches(key) {
                        self.nav.reset(RepoPhase::Input);
                    }
                    Command::none()
                }
            }
            RepoPhase::DirExists | RepoPhase::CloneComplete => {
                if self.keys.enter.matches(key) {
                    self.finish()
                } else {
                    if self.keys.back.matches(key) {
                        self.nav.reset(RepoPhase::Input);
                    }
                    Command::none()
                }
            }
            RepoPhase::Validating | RepoPhase::Cloning => Command::none(),
        }
    }

    fn handle_result(&mut self, msg: &RepoMsg) -> Command {
        match (self.phase(), msg) {
            (RepoPhase::Validating, RepoMsg::Validated(outcome)) => {
                if let Some(e) = &outcome.error {
                    info!("Repository validation failed: {}", e);
                    self.error = Some(e.clone());
                    self.nav.pop();
                } else if outcome.already_exists {
                    self.nav.push(RepoPhase::DirExists);
                } else {
                    self.nav.push(RepoPhase::Confirmation);
                }
            }
            (RepoPhase::Cloning, RepoMsg::Cloned(result)) => match result {
                Ok(()) => self.nav.push(RepoPhase::CloneComplete),
                Err(e) => {
                    info!("Clone failed: {}", e);
                    self.error = Some(e.clone());
                    self.nav.reset(RepoPhase::Input);
                }
            },
            (phase, msg) => debug!("Dropping stale repo result {:?} in {:?}", msg, phase),
        }
        Command::none()
    }

    fn input_lines(&self, theme: &Theme) -> Vec<Line<'_>> {
        let mut lines = Vec::new();
        if let Some(e) = &self.error {
            lines.push(Line::styled(e.to_string(), theme.error_style()));
            lines.push(Line::from(""));
        }
        lines.push(Line::from("Enter the path to your dotfiles repository on GitHub."));
        lines.push(Line::styled("(e.g., octocat/dotfiles)", theme.muted_style()));
        lines.push(self.repo.render("Repository", self.focus == Field::Repo, theme));
        lines.push(Line::from(""));
        lines.push(Line::from("Where should the repository be cloned?"));
        lines.push(self.destination.render(
            "Destination",
            self.focus == Field::Destination,
            theme,
        ));
        lines.push(Line::from(""));
        lines.push(Line::styled(
            "Use Tab/Shift+Tab or ↑/↓ to switch. Press Enter to continue.",
            theme.muted_style(),
        ));
        lines
    }
}

impl Stage for RepoStage {
    fn id(&self) -> StageId {
        StageId::Repo
    }

    fn init(&mut self) -> Command {
        self.nav.reset(RepoPhase::Input);
        self.focus = Field::Repo;
        self.error = None;
        Command::none()
    }

    fn update(&mut self, msg: &Message) -> Command {
        if track_resize(&mut self.viewport, msg) {
            return Command::none();
        }
        match msg {
            Message::Tick => {
                if matches!(self.phase(), RepoPhase::Validating | RepoPhase::Cloning) {
                    self.spinner.tick();
                }
                Command::none()
            }
            Message::Key(key) => self.handle_key(key),
            Message::Repo(result) => self.handle_result(result),
            Message::Status(StatusUpdate::Auth {
                authenticated: true,
                username: Some(username),
            }) => {
                self.repo.set(&format!("{username}/dotfiles"));
                Command::none()
            }
            _ => Command::none(),
        }
    }

    fn view(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let spin = self.spinner.glyph();
        let dest = self.dest_path();
        let lines = match self.phase() {
            RepoPhase::Input => self.input_lines(theme),
            RepoPhase::Validating => vec![Line::from(format!(
                "{spin} Verifying repository and destination..."
            ))],
            RepoPhase::Confirmation => vec![
                Line::from(vec![
                    Span::raw("Ready to clone "),
                    Span::styled(self.repo_path(), theme.title_style()),
                    Span::raw(" into "),
                    Span::styled(dest, theme.title_style()),
                    Span::raw("?"),
                ]),
                Line::from(""),
                Line::styled("Press Enter to confirm, or Esc to go back.", theme.muted_style()),
            ],
            RepoPhase::DirExists => vec![
                Line::from(vec![
                    Span::styled("✓ ", theme.success_style()),
                    Span::raw("Dotfiles directory already found at "),
                    Span::styled(dest, theme.title_style()),
                ]),
                Line::from(""),
                Line::styled("Press Enter to continue, or Esc to go back.", theme.muted_style()),
            ],
            RepoPhase::Cloning => vec![Line::from(format!("{spin} Cloning into {dest}..."))],
            RepoPhase::CloneComplete => vec![
                Line::styled("✓ Dotfiles cloned successfully!", theme.success_style()),
                Line::from(""),
                Line::styled("Press Enter to continue, or Esc to go back.", theme.muted_style()),
            ],
        };
        draw_panel(frame, area, "Dotfiles Setup", lines, theme);
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn status_bar(&self) -> StatusBarState {
        match self.phase() {
            RepoPhase::Input => StatusBarState::from_bindings(
                &[self.keys.tab, self.keys.back],
                &[self.keys.enter],
            ),
            RepoPhase::Validating | RepoPhase::Cloning => StatusBarState::busy(),
            _ => StatusBarState::from_bindings(&[self.keys.back], &[self.keys.enter]),
        }
    }

    fn wants(&self, status: &StatusUpdate) -> bool {
        matches!(status, StatusUpdate::Auth { .. })
    }

    fn snapshot(&self) -> Box<dyn Stage> {
        Box::new(self.clone())
    }
}
