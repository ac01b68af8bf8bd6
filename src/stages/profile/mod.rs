//! Profile-driven package installation.
//!
//! Reads the definitions file from the cloned repository, lets the user pick
//! one profile, then installs its packages one streamed process at a time
//! while the dotfiles are linked in the background.

mod config;
mod service;

pub use config::{parse_package_list, PostInstall, Profile, ProfileFile};
pub use service::{PackageManager, ProfileError, ProfileService};

use std::path::PathBuf;
use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::{prelude::*, Frame};
use tracing::{debug, info, warn};

use super::{track_resize, Stage, Viewport};
use crate::bus::Command;
use crate::keys::KeyMap;
use crate::message::{Message, StageId, StatusUpdate};
use crate::navigator::Navigator;
use crate::process::{self, ProcessError, ProcessEvent, Step, StreamId};
use crate::system::CommandSpec;
use crate::ui::widgets::{draw_log, draw_panel, LogBuffer, Spinner, StatusBarState};
use crate::ui::Theme;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilePhase {
    CheckingConfig,
    SelectOption,
    LoadingPackages,
    Confirmation,
    CheckingPackageManager,
    InstallingPackageManager,
    InstallingPackages,
    PostInstallConfirmation,
    PostInstallRunning,
    InstallComplete,
    Error,
}

#[derive(Debug, Clone)]
pub enum ProfileMsg {
    Loaded(Result<Option<Vec<Profile>>, ProfileError>),
    PackagesLoaded(Result<Vec<String>, ProfileError>),
    ManagerChecked(Result<bool, ProfileError>),
    Stowed(Result<(), ProfileError>),
    Process(ProcessEvent),
}

const TITLE: &str = "Machine Profile";

fn wrap(event: ProcessEvent) -> Message {
    Message::Profile(ProfileMsg::Process(event))
}

/// What the followed process is doing for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Bootstrap(PackageManager),
    Package(PackageManager, usize),
    PostInstall,
}

#[derive(Debug, Clone)]
pub struct ProfileStage {
    service: Arc<ProfileService>,
    keys: KeyMap,
    nav: Navigator<ProfilePhase>,
    viewport: Viewport,
    spinner: Spinner,
    repo: Option<PathBuf>,
    profiles: Vec<Profile>,
    selected: usize,
    chosen: Option<Profile>,
    packages: Vec<String>,
    current: usize,
    succeeded: Vec<String>,
    failed: Vec<String>,
    stow_pending: bool,
    stow_error: Option<ProfileError>,
    running: Option<(StreamId, Purpose)>,
    log: LogBuffer,
    error: Option<ProfileError>,
}

impl ProfileStage {
    pub fn new(service: Arc<ProfileService>) -> Self {
        Self {
            service,
            keys: KeyMap::default(),
            nav: Navigator::new(ProfilePhase::CheckingConfig),
            viewport: Viewport::default(),
            spinner: Spinner::default(),
            repo: None,
            profiles: Vec::new(),
            selected: 0,
            chosen: None,
            packages: Vec::new(),
            current: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
            stow_pending: false,
            stow_error: None,
            running: None,
            log: LogBuffer::default(),
            error: None,
        }
    }

    pub fn phase(&self) -> ProfilePhase {
        self.nav.current()
    }

    pub fn error(&self) -> Option<&ProfileError> {
        self.error.as_ref()
    }

    pub fn succeeded(&self) -> &[String] {
        &self.succeeded
    }

    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    fn fail(&mut self, error: ProfileError) -> Command {
        warn!("Profile install error: {}", error);
        self.running = None;
        self.error = Some(error);
        self.nav.push(ProfilePhase::Error);
        Command::none()
    }

    fn repo_path(&self) -> Result<PathBuf, ProfileError> {
        self.repo.clone().ok_or(ProfileError::NoRepository)
    }

    fn load_profiles(&mut self) -> Command {
        let repo = match self.repo_path() {
            Ok(repo) => repo,
            Err(e) => return self.fail(e),
        };
        let service = Arc::clone(&self.service);
        Command::blocking(move || {
            Message::Profile(ProfileMsg::Loaded(service.load_profiles(&repo)))
        })
    }

    fn choose(&mut self) -> Command {
        let Some(profile) = self.profiles.get(self.selected).cloned() else {
            return Command::none();
        };
        let repo = match self.repo_path() {
            Ok(repo) => repo,
            Err(e) => return self.fail(e),
        };
        info!("Selected profile {}", profile.name);
        let list = profile.path.clone();
        self.chosen = Some(profile);
        self.nav.push(ProfilePhase::LoadingPackages);
        let service = Arc::clone(&self.service);
        Command::blocking(move || {
            Message::Profile(ProfileMsg::PackagesLoaded(service.load_packages(&repo, &list)))
        })
    }

    fn check_manager(&mut self) -> Command {
        self.nav.push(ProfilePhase::CheckingPackageManager);
        let service = Arc::clone(&self.service);
        Command::blocking(move || {
            Message::Profile(ProfileMsg::ManagerChecked(service.check_package_manager()))
        })
    }

    fn launch(&mut self, spec: CommandSpec, purpose: Purpose) -> Command {
        self.log.push(format!("$ {}", spec.display()));
        let (id, cmd) = process::launch(self.service.executor(), spec, wrap);
        debug!("Following process {} for {:?}", id, purpose);
        self.running = Some((id, purpose));
        cmd
    }

    fn bootstrap(&mut self) -> Command {
        let manager = match self.service.package_manager() {
            Ok(manager) => manager,
            Err(e) => return self.fail(e),
        };
        info!("{} not found, bootstrapping it", manager.program());
        self.nav.push(ProfilePhase::InstallingPackageManager);
        self.log.clear();
        let spec = self.service.bootstrap_spec(manager);
        self.launch(spec, Purpose::Bootstrap(manager))
    }

    /// Starts linking and the first package together.
    fn start_packages(&mut self) -> Command {
        let manager = match self.service.package_manager() {
            Ok(manager) => manager,
            Err(e) => return self.fail(e),
        };
        let repo = match self.repo_path() {
            Ok(repo) => repo,
            Err(e) => return self.fail(e),
        };
        self.nav.reset(ProfilePhase::InstallingPackages);
        self.current = 0;
        self.succeeded.clear();
        self.failed.clear();
        self.stow_error = None;
        self.log.clear();

        let dirs = self
            .chosen
            .as_ref()
            .map(|p| p.stow_dirs.clone())
            .unwrap_or_default();
        self.stow_pending = true;
        let service = Arc::clone(&self.service);
        let stow = Command::blocking(move || {
            Message::Profile(ProfileMsg::Stowed(service.stow(&repo, &dirs)))
        });

        let first = match self.packages.first() {
            Some(package) => {
                let spec = self.service.install_spec(manager, package);
                self.launch(spec, Purpose::Package(manager, 0))
            }
            None => self.packages_done(),
        };
        Command::batch([stow, first])
    }

    fn packages_done(&mut self) -> Command {
        self.running = None;
        info!(
            "Packages processed: {} succeeded, {} failed",
            self.succeeded.len(),
            self.failed.len()
        );
        let has_post_install = self
            .chosen
            .as_ref()
            .is_some_and(|p| p.post_install.is_some());
        if has_post_install {
            self.nav.push(ProfilePhase::PostInstallConfirmation);
        } else {
            self.nav.push(ProfilePhase::InstallComplete);
        }
        Command::none()
    }

    fn package_finished(
        &mut self,
        manager: PackageManager,
        index: usize,
        result: Result<(), ProcessError>,
    ) -> Command {
        let Some(package) = self.packages.get(index).cloned() else {
            return self.packages_done();
        };
        match result {
            Ok(()) => {
                self.log.push(format!("✓ Installed {package}"));
                self.succeeded.push(package);
            }
            Err(e) => {
                warn!("Failed to install {}: {}", package, e);
                self.log.push(format!("✗ Failed to install {package}"));
                self.failed.push(package);
            }
        }

        self.current = index + 1;
        match self.packages.get(self.current) {
            Some(next) => {
                let spec = self.service.install_spec(manager, next);
                self.launch(spec, Purpose::Package(manager, self.current))
            }
            None => self.packages_done(),
        }
    }

    fn run_post_install(&mut self) -> Command {
        let Some(profile) = self.chosen.clone() else {
            return self.fail(ProfileError::PostInstall("no profile selected".into()));
        };
        let Some(post) = profile.post_install.as_ref() else {
            self.nav.push(ProfilePhase::InstallComplete);
            return Command::none();
        };
        let repo = match self.repo_path() {
            Ok(repo) => repo,
            Err(e) => return self.fail(e),
        };
        self.nav.push(ProfilePhase::PostInstallRunning);
        self.log.clear();
        let spec = self.service.post_install_spec(&repo, post, &profile.roles_env());
        self.launch(spec, Purpose::PostInstall)
    }

    fn handle_process(&mut self, event: &ProcessEvent) -> Command {
        let active = self.running.map(|(id, _)| id);
        let (step, read) = process::advance(active, event, wrap);
        match step {
            Step::Started | Step::Stale => read,
            Step::Line(line) => {
                self.log.push(line);
                read
            }
            Step::Exited(result) => {
                let Some((_, purpose)) = self.running.take() else {
                    return read;
                };
                match purpose {
                    Purpose::Bootstrap(manager) => match result {
                        Ok(()) => {
                            info!("{} installed", manager.program());
                            self.start_packages()
                        }
                        Err(e) => self.fail(ProfileError::Bootstrap(e.to_string())),
                    },
                    Purpose::Package(manager, index) => {
                        self.package_finished(manager, index, result)
                    }
                    Purpose::PostInstall => match result {
                        Ok(()) => {
                            info!("Post-install command succeeded");
                            self.nav.push(ProfilePhase::InstallComplete);
                            Command::none()
                        }
                        Err(e) => self.fail(ProfileError::PostInstall(e.to_string())),
                    },
                }
            }
        }
    }

    fn handle_result(&mut self, msg: &ProfileMsg) -> Command {
        match (self.phase(), msg) {
            (_, ProfileMsg::Process(event)) => self.handle_process(event),
            (_, ProfileMsg::Stowed(result)) => {
                if !self.stow_pending {
                    debug!("Dropping stale stow result {:?}", result);
                    return Command::none();
                }
                self.stow_pending = false;
                match result {
                    Ok(()) => self.log.push("✓ Linked dotfiles"),
                    Err(e) => {
                        self.log.push(format!("✗ {e}"));
                        self.stow_error = Some(e.clone());
                    }
                }
                Command::none()
            }
            (ProfilePhase::CheckingConfig, ProfileMsg::Loaded(result)) => match result {
                Err(e) => self.fail(e.clone()),
                Ok(profiles) => {
                    self.profiles = profiles.clone().unwrap_or_default();
                    self.selected = 0;
                    self.nav.reset(ProfilePhase::SelectOption);
                    Command::none()
                }
            },
            (ProfilePhase::LoadingPackages, ProfileMsg::PackagesLoaded(result)) => match result {
                Err(e) => self.fail(e.clone()),
                Ok(packages) => {
                    self.packages = packages.clone();
                    self.nav.push(ProfilePhase::Confirmation);
                    Command::none()
                }
            },
            (ProfilePhase::CheckingPackageManager, ProfileMsg::ManagerChecked(result)) => {
                match result {
                    Err(e) => self.fail(e.clone()),
                    Ok(true) => self.start_packages(),
                    Ok(false) => self.bootstrap(),
                }
            }
            (phase, msg) => {
                debug!("Dropping stale profile result {:?} in {:?}", msg, phase);
                Command::none()
            }
        }
    }

    fn handle_key(&mut self, key: &KeyEvent) -> Command {
        let enter = self.keys.enter.matches(key);
        let back = self.keys.back.matches(key);
        match self.phase() {
            ProfilePhase::SelectOption => {
                if self.profiles.is_empty() || back {
                    if enter || back {
                        return Command::message(Message::StageCancelled(StageId::Profile));
                    }
                } else if enter {
                    return self.choose();
                } else if self.keys.up.matches(key) {
                    self.selected = self.selected.saturating_sub(1);
                } else if self.keys.down.matches(key) {
                    self.selected = (self.selected + 1).min(self.profiles.len() - 1);
                }
                Command::none()
            }
            ProfilePhase::Confirmation => {
                if enter {
                    self.check_manager()
                } else {
                    if back {
                        self.nav.reset(ProfilePhase::SelectOption);
                    }
                    Command::none()
                }
            }
            ProfilePhase::PostInstallConfirmation => {
                if enter {
                    self.run_post_install()
                } else {
                    if back {
                        info!("Post-install skipped");
                        self.nav.push(ProfilePhase::InstallComplete);
                    }
                    Command::none()
                }
            }
            ProfilePhase::InstallComplete if enter => Command::message(Message::StageFinished {
                stage: StageId::Profile,
                payload: None,
            }),
            ProfilePhase::Error if enter || back => {
                self.error = None;
                self.nav.reset(ProfilePhase::SelectOption);
                Command::none()
            }
            _ => Command::none(),
        }
    }

    fn profile_name(&self) -> &str {
        self.chosen.as_ref().map(|p| p.name.as_str()).unwrap_or("")
    }

    fn select_lines(&self, theme: &Theme) -> Vec<Line<'static>> {
        if self.profiles.is_empty() {
            return vec![
                Line::from("No profiles found"),
                Line::from(""),
                Line::styled("Press Enter or Esc to go back.", theme.muted_style()),
            ];
        }
        let mut lines = Vec::new();
        for (i, profile) in self.profiles.iter().enumerate() {
            if i == self.selected {
                lines.push(Line::styled(format!("» {}", profile.name), theme.title_style()));
            } else {
                lines.push(Line::from(format!("  {}", profile.name)));
            }
            lines.push(Line::styled(format!("  {}", profile.description), theme.muted_style()));
        }
        lines
    }

    fn complete_lines(&self, theme: &Theme) -> Vec<Line<'static>> {
        let mut lines = vec![
            Line::styled("✓ Installation Complete!", theme.success_style()),
            Line::from(""),
            Line::from(format!(
                "Succeeded: {}, Failed: {}",
                self.succeeded.len(),
                self.failed.len()
            )),
        ];
        if !self.failed.is_empty() {
            lines.push(Line::from(""));
            lines.push(Line::from("Failed packages:"));
            for package in &self.failed {
                lines.push(Line::styled(format!("  - {package}"), theme.error_style()));
            }
        }
        if let Some(e) = &self.stow_error {
            lines.push(Line::from(""));
            lines.push(Line::styled(e.to_string(), theme.error_style()));
        }
        lines.push(Line::from(""));
        lines.push(Line::styled(
            "Press Enter to return to the main menu.",
            theme.muted_style(),
        ));
        lines
    }

    fn draw_running(&self, frame: &mut Frame, area: Rect, header: String, theme: &Theme) {
        let [top, log, help] = Layout::vertical([
            Constraint::Length(2),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .areas(area);
        frame.render_widget(
            Line::styled(format!("{} {}", self.spinner.glyph(), header), theme.title_style()),
            top,
        );
        draw_log(frame, log, "Output", &self.log, theme);
        frame.render_widget(
            Line::styled("Please wait, this may take a while...", theme.muted_style()),
            help,
        );
    }
}

impl Stage for ProfileStage {
    fn id(&self) -> StageId {
        StageId::Profile
    }

    fn init(&mut self) -> Command {
        if let Some((id, purpose)) = self.running.take() {
            debug!("Leaving process {} ({:?}) to drain", id, purpose);
        }
        self.nav.reset(ProfilePhase::CheckingConfig);
        self.profiles.clear();
        self.selected = 0;
        self.chosen = None;
        self.packages.clear();
        self.current = 0;
        self.succeeded.clear();
        self.failed.clear();
        self.stow_pending = false;
        self.stow_error = None;
        self.log.clear();
        self.error = None;
        self.load_profiles()
    }

    fn update(&mut self, msg: &Message) -> Command {
        if track_resize(&mut self.viewport, msg) {
            return Command::none();
        }
        match msg {
            Message::Tick => {
                self.spinner.tick();
                Command::none()
            }
            Message::Key(key) => self.handle_key(key),
            Message::Profile(result) => self.handle_result(result),
            Message::Status(StatusUpdate::RepoPath(path)) => {
                debug!("Profile stage now reads {:?}", path);
                self.repo = Some(path.clone());
                Command::none()
            }
            _ => Command::none(),
        }
    }

    fn view(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let spin = self.spinner.glyph();
        match self.phase() {
            ProfilePhase::CheckingConfig => draw_panel(
                frame,
                area,
                TITLE,
                vec![Line::from(format!(
                    "{spin} Checking for custom profiles configuration..."
                ))],
                theme,
            ),
            ProfilePhase::SelectOption => {
                draw_panel(frame, area, "Select a Machine Profile", self.select_lines(theme), theme)
            }
            ProfilePhase::LoadingPackages => draw_panel(
                frame,
                area,
                TITLE,
                vec![Line::from(format!(
                    "{spin} Loading packages for {}...",
                    self.profile_name()
                ))],
                theme,
            ),
            ProfilePhase::Confirmation => {
                let rows = self.viewport.log_rows(8) as usize;
                let mut lines = vec![
                    Line::styled(
                        format!("Ready to install profile '{}'?", self.profile_name()),
                        theme.title_style(),
                    ),
                    Line::from(""),
                    Line::from("The following packages will be installed:"),
                ];
                lines.extend(
                    self.packages
                        .iter()
                        .take(rows)
                        .map(|p| Line::from(format!("  {p}"))),
                );
                if self.packages.len() > rows {
                    lines.push(Line::styled(
                        format!("  ... and {} more", self.packages.len() - rows),
                        theme.muted_style(),
                    ));
                }
                lines.push(Line::from(""));
                lines.push(Line::styled(
                    "Press Enter to confirm, Esc to go back.",
                    theme.muted_style(),
                ));
                draw_panel(frame, area, TITLE, lines, theme);
            }
            ProfilePhase::CheckingPackageManager => draw_panel(
                frame,
                area,
                TITLE,
                vec![Line::from(format!("{spin} Checking for a package manager..."))],
                theme,
            ),
            ProfilePhase::InstallingPackageManager => {
                self.draw_running(frame, area, "Installing package manager".to_string(), theme)
            }
            ProfilePhase::InstallingPackages => {
                let total = self.packages.len();
                let package = self
                    .packages
                    .get(self.current)
                    .map(String::as_str)
                    .unwrap_or("(finalizing)");
                let header = format!(
                    "Installing ({}/{}): {}",
                    (self.current + 1).min(total),
                    total,
                    package
                );
                self.draw_running(frame, area, header, theme);
            }
            ProfilePhase::PostInstallConfirmation => {
                let description = self
                    .chosen
                    .as_ref()
                    .and_then(|p| p.post_install.as_ref())
                    .map(|p| p.description.clone())
                    .unwrap_or_default();
                draw_panel(
                    frame,
                    area,
                    "Run Post-Install Script?",
                    vec![
                        Line::from(description),
                        Line::from(""),
                        Line::styled("Press Enter to run, Esc to skip.", theme.muted_style()),
                    ],
                    theme,
                );
            }
            ProfilePhase::PostInstallRunning => {
                let command = self
                    .chosen
                    .as_ref()
                    .and_then(|p| p.post_install.as_ref())
                    .map(|p| p.command.clone())
                    .unwrap_or_default();
                self.draw_running(frame, area, format!("Running: {command}"), theme);
            }
            ProfilePhase::InstallComplete => {
                draw_panel(frame, area, TITLE, self.complete_lines(theme), theme)
            }
            ProfilePhase::Error => {
                let text = self
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string());
                draw_panel(
                    frame,
                    area,
                    TITLE,
                    vec![
                        Line::styled(format!("Error: {text}"), theme.error_style()),
                        Line::from(""),
                        Line::styled("Press Enter or Esc to go back.", theme.muted_style()),
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
            ProfilePhase::SelectOption => StatusBarState::from_bindings(
                &[self.keys.up, self.keys.down, self.keys.back],
                &[self.keys.enter],
            ),
            ProfilePhase::Confirmation | ProfilePhase::PostInstallConfirmation => {
                StatusBarState::from_bindings(&[self.keys.back], &[self.keys.enter])
            }
            ProfilePhase::InstallComplete => StatusBarState::from_bindings(&[], &[self.keys.enter]),
            ProfilePhase::Error => {
                StatusBarState::from_bindings(&[self.keys.back], &[self.keys.enter])
            }
            _ => StatusBarState::busy(),
        }
    }

    fn wants(&self, status: &StatusUpdate) -> bool {
        matches!(status, StatusUpdate::RepoPath(_))
    }

    fn snapshot(&self) -> Box<dyn Stage> {
        Box::new(self.clone())
    }
}
