mod service;

pub use service::{parse_ssh_output, IdentityError, IdentityService, KeyStatus};

use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::{prelude::*, Frame};
use tracing::{debug, info};

use super::{track_resize, Stage, Viewport};
use crate::bus::Command;
use crate::keys::KeyMap;
use crate::message::{Message, StageId, StagePayload};
use crate::navigator::Navigator;
use crate::ui::widgets::{draw_panel, Spinner, StatusBarState};
use crate::ui::Theme;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    CheckingKey,
    GeneratingKey,
    DisplayingKey,
    Verifying,
    AuthComplete,
    FinalSuccess,
    AuthError,
}

#[derive(Debug, Clone)]
pub enum IdentityMsg {
    KeyChecked(Result<KeyStatus, IdentityError>),
    KeyGenerated(Result<String, IdentityError>),
    Verified(Result<String, IdentityError>),
}

#[derive(Debug, Clone)]
pub struct IdentityStage {
    service: Arc<IdentityService>,
    keys: KeyMap,
    nav: Navigator<AuthPhase>,
    viewport: Viewport,
    spinner: Spinner,
    public_key: Option<String>,
    username: Option<String>,
    error: Option<IdentityError>,
}

impl IdentityStage {
    pub fn new(service: Arc<IdentityService>) -> Self {
        Self {
            service,
            keys: KeyMap::default(),
            nav: Navigator::new(AuthPhase::CheckingKey),
            viewport: Viewport::default(),
            spinner: Spinner::default(),
            public_key: None,
            username: None,
            error: None,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.nav.current()
    }

    pub fn error(&self) -> Option<&IdentityError> {
        self.error.as_ref()
    }

    fn check_key(&self) -> Command {
        let service = Arc::clone(&self.service);
        Command::blocking(move || Message::Identity(IdentityMsg::KeyChecked(service.check_key())))
    }

    fn generate_key(&self) -> Command {
        let service = Arc::clone(&self.service);
        Command::blocking(move || {
            Message::Identity(IdentityMsg::KeyGenerated(service.generate_key()))
        })
    }

    fn verify(&self) -> Command {
        let service = Arc::clone(&self.service);
        Command::blocking(move || Message::Identity(IdentityMsg::Verified(service.verify())))
    }

    fn fail(&mut self, error: IdentityError) {
        info!("Identity error: {}", error);
        self.error = Some(error);
        self.nav.push(AuthPhase::AuthError);
    }

    fn handle_result(&mut self, msg: &IdentityMsg) -> Command {
        match (self.phase(), msg) {
            (AuthPhase::CheckingKey, IdentityMsg::KeyChecked(result)) => match result {
                Err(e) => {
                    self.fail(e.clone());
                    Command::none()
                }
                Ok(status) if !status.exists => {
                    self.nav.push(AuthPhase::GeneratingKey);
                    self.generate_key()
                }
                Ok(status) => {
                    self.public_key = status.public_key.clone();
                    self.username = status.username.clone();
                    if status.authenticated {
                        self.nav.push(AuthPhase::AuthComplete);
                    } else {
                        self.nav.push(AuthPhase::DisplayingKey);
                    }
                    Command::none()
                }
            },
            (AuthPhase::GeneratingKey, IdentityMsg::KeyGenerated(result)) => {
                match result {
                    Ok(key) => {
                        self.public_key = Some(key.clone());
                        self.nav.push(AuthPhase::DisplayingKey);
                    }
                    Err(e) => self.fail(e.clone()),
                }
                Command::none()
            }
            (AuthPhase::Verifying, IdentityMsg::Verified(result)) => {
                match result {
                    Ok(username) => {
                        self.username = Some(username.clone());
                        self.nav.push(AuthPhase::FinalSuccess);
                    }
                    Err(e) => self.fail(e.clone()),
                }
                Command::none()
            }
            (phase, msg) => {
                debug!("Dropping stale identity result {:?} in {:?}", msg, phase);
                Command::none()
            }
        }
    }

    fn handle_key(&mut self, key: &KeyEvent) -> Command {
        match self.phase() {
            AuthPhase::DisplayingKey | AuthPhase::AuthError | AuthPhase::AuthComplete => {
                if self.keys.enter.matches(key) {
                    self.error = None;
                    self.nav.push(AuthPhase::Verifying);
                    self.verify()
                } else if self.keys.back.matches(key) {
                    Command::message(Message::StageCancelled(StageId::Identity))
                } else {
                    Command::none()
                }
            }
            AuthPhase::FinalSuccess => {
                if self.keys.enter.matches(key) {
                    Command::message(Message::StageFinished {
                        stage: StageId::Identity,
                        payload: Some(StagePayload::Authenticated {
                            username: self.username.clone().unwrap_or_default(),
                        }),
                    })
                } else {
                    Command::none()
                }
            }
            AuthPhase::CheckingKey | AuthPhase::GeneratingKey | AuthPhase::Verifying => {
                Command::none()
            }
        }
    }

    fn busy(&self) -> bool {
        matches!(
            self.phase(),
            AuthPhase::CheckingKey | AuthPhase::GeneratingKey | AuthPhase::Verifying
        )
    }
}

impl Stage for IdentityStage {
    fn id(&self) -> StageId {
        StageId::Identity
    }

    fn init(&mut self) -> Command {
        self.nav.reset(AuthPhase::CheckingKey);
        self.public_key = None;
        self.username = None;
        self.error = None;
        self.check_key()
    }

    fn update(&mut self, msg: &Message) -> Command {
        if track_resize(&mut self.viewport, msg) {
            return Command::none();
        }
        match msg {
            Message::Tick => {
                if self.busy() {
                    self.spinner.tick();
                }
                Command::none()
            }
            Message::Key(key) => self.handle_key(key),
            Message::Identity(result) => self.handle_result(result),
            _ => Command::none(),
        }
    }

    fn view(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let spin = self.spinner.glyph();
        let mut lines: Vec<Line> = Vec::new();
        match self.phase() {
            AuthPhase::CheckingKey => {
                lines.push(Line::from(format!("{spin} Checking for an existing SSH key...")));
            }
            AuthPhase::GeneratingKey => {
                lines.push(Line::from(format!("{spin} Generating a new ed25519 key...")));
            }
            AuthPhase::DisplayingKey => {
                lines.push(Line::from(format!(
                    "Add this public key to your {} account (Settings > SSH and GPG keys):",
                    self.service.host()
                )));
                lines.push(Line::from(""));
                lines.push(Line::styled(
                    self.public_key.clone().unwrap_or_default(),
                    theme.secondary_style(),
                ));
                lines.push(Line::from(""));
                lines.push(Line::styled(
                    "Press Enter once the key is added to verify the connection.",
                    theme.muted_style(),
                ));
            }
            AuthPhase::Verifying => {
                lines.push(Line::from(format!(
                    "{spin} Verifying connection to {}...",
                    self.service.host()
                )));
            }
            AuthPhase::AuthComplete => {
                lines.push(Line::styled(
                    format!(
                        "✓ Already authenticated as {}",
                        self.username.as_deref().unwrap_or("unknown user")
                    ),
                    theme.success_style(),
                ));
                lines.push(Line::from(""));
                lines.push(Line::styled(
                    "Press Enter to verify again, Esc to go back.",
                    theme.muted_style(),
                ));
            }
            AuthPhase::FinalSuccess => {
                lines.push(Line::styled(
                    format!(
                        "✓ Authenticated as {}",
                        self.username.as_deref().unwrap_or("unknown user")
                    ),
                    theme.success_style(),
                ));
                lines.push(Line::from(""));
                lines.push(Line::styled("Press Enter to continue.", theme.muted_style()));
            }
            AuthPhase::AuthError => {
                let text = self
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string());
                lines.push(Line::styled(format!("✗ {text}"), theme.error_style()));
                lines.push(Line::from(""));
                lines.push(Line::styled(
                    "Press Enter to retry, Esc to go back.",
                    theme.muted_style(),
                ));
            }
        }
        draw_panel(frame, area, "GitHub Authentication", lines, theme);
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn status_bar(&self) -> StatusBarState {
        match self.phase() {
            AuthPhase::FinalSuccess => StatusBarState::from_bindings(&[], &[self.keys.enter]),
            _ if self.busy() => StatusBarState::busy(),
            _ => StatusBarState::from_bindings(&[self.keys.back], &[self.keys.enter]),
        }
    }

    fn snapshot(&self) -> Box<dyn Stage> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::stages::testing::{enter, esc, render, resolve};
    use crate::system::mock::MockExecutor;
    use crate::system::CommandOutput;

    fn stage_with(executor: MockExecutor, dir: &std::path::Path) -> IdentityStage {
        let config = IdentityConfig {
            ssh_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        IdentityStage::new(Arc::new(IdentityService::new(Arc::new(executor), &config)))
    }

    fn greeting() -> MockExecutor {
        MockExecutor::new().respond(
            "ssh",
            CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "Hi octocat! You've successfully authenticated, but GitHub does not provide shell access.".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_missing_key_goes_through_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut stage = stage_with(MockExecutor::new(), dir.path());
        let msg = resolve(stage.init()).await;
        assert_eq!(stage.phase(), AuthPhase::CheckingKey);

        let cmd = stage.update(&msg);
        assert_eq!(stage.phase(), AuthPhase::GeneratingKey);
        assert_eq!(cmd.task_count(), 1);

        // ssh-keygen is mocked, so fake its output file.
        std::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAAnew me@host\n").unwrap();
        let msg = resolve(cmd).await;
        stage.update(&msg);
        assert_eq!(stage.phase(), AuthPhase::DisplayingKey);
        assert!(render(&stage, 90, 20).contains("ssh-ed25519 AAAAnew"));
    }

    #[tokio::test]
    async fn test_existing_verified_key_goes_to_auth_complete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAA\n").unwrap();
        let mut stage = stage_with(greeting(), dir.path());
        let msg = resolve(stage.init()).await;
        stage.update(&msg);
        assert_eq!(stage.phase(), AuthPhase::AuthComplete);
    }

    #[tokio::test]
    async fn test_verify_success_then_finish_with_username() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAA\n").unwrap();
        let mut stage = stage_with(greeting(), dir.path());
        let msg = resolve(stage.init()).await;
        stage.update(&msg);

        let cmd = stage.update(&enter());
        assert_eq!(stage.phase(), AuthPhase::Verifying);
        let msg = resolve(cmd).await;
        stage.update(&msg);
        assert_eq!(stage.phase(), AuthPhase::FinalSuccess);

        match resolve(stage.update(&enter())).await {
            Message::StageFinished { stage: id, payload } => {
                assert_eq!(id, StageId::Identity);
                assert_eq!(
                    payload,
                    Some(StagePayload::Authenticated {
                        username: "octocat".to_string()
                    })
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_failure_shows_error_and_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAA\n").unwrap();
        let executor = MockExecutor::new().fail("ssh", 255, "Permission denied (publickey).");
        let mut stage = stage_with(executor, dir.path());
        let msg = resolve(stage.init()).await;
        stage.update(&msg);
        assert_eq!(stage.phase(), AuthPhase::DisplayingKey);

        let msg = resolve(stage.update(&enter())).await;
        stage.update(&msg);
        assert_eq!(stage.phase(), AuthPhase::AuthError);
        assert!(render(&stage, 90, 20).contains("SSH connection failed"));

        // Retry clears the error.
        let cmd = stage.update(&enter());
        assert_eq!(stage.phase(), AuthPhase::Verifying);
        assert!(stage.error().is_none());
        assert_eq!(cmd.task_count(), 1);
    }

    #[tokio::test]
    async fn test_back_cancels_and_stale_results_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAAA\n").unwrap();
        let mut stage = stage_with(MockExecutor::new(), dir.path());
        let msg = resolve(stage.init()).await;
        stage.update(&msg);
        assert_eq!(stage.phase(), AuthPhase::DisplayingKey);

        // A verification result nobody asked for.
        stage.update(&Message::Identity(IdentityMsg::Verified(Ok("ghost".into()))));
        assert_eq!(stage.phase(), AuthPhase::DisplayingKey);

        assert!(matches!(
            resolve(stage.update(&esc())).await,
            Message::StageCancelled(StageId::Identity)
        ));
    }
}
