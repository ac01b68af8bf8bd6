use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::{prelude::*, Frame};
use tracing::debug;

use super::identity::IdentityService;
use super::{track_resize, Stage, Viewport};
use crate::bus::Command;
use crate::keys::KeyMap;
use crate::message::{Message, StageId, StatusUpdate};
use crate::ui::widgets::{draw_panel, StatusBarState};
use crate::ui::Theme;

const SELECTED_PREFIX: &str = "» ";
const IDENTITY_DESC: &str = "Set up SSH keys for GitHub.";
const REPO_DESC: &str = "Clone and set up your dotfiles.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    pub stage: StageId,
    pub title: &'static str,
    pub description: String,
    pub enabled: bool,
    pub done: bool,
}

impl MenuItem {
    fn new(stage: StageId, title: &'static str, description: String, enabled: bool) -> Self {
        Self {
            stage,
            title,
            description,
            enabled,
            done: false,
        }
    }
}

fn default_items() -> Vec<MenuItem> {
    vec![
        MenuItem::new(
            StageId::Identity,
            "GitHub Authentication",
            format!("{IDENTITY_DESC} Checking..."),
            true,
        ),
        MenuItem::new(
            StageId::Repo,
            "Dotfiles Setup",
            format!("{REPO_DESC} (Not Authenticated)"),
            false,
        ),
        MenuItem::new(
            StageId::Driver,
            "NVIDIA Drivers",
            "Checking for an NVIDIA GPU...".to_string(),
            false,
        ),
        MenuItem::new(
            StageId::Profile,
            "Machine Profile",
            "Pick a machine profile to match your setup".to_string(),
            false,
        ),
    ]
}

/// Root stage: lists the setup stages and tracks which are available.
#[derive(Debug, Clone)]
pub struct MenuStage {
    title: String,
    identity: Arc<IdentityService>,
    keys: KeyMap,
    viewport: Viewport,
    items: Vec<MenuItem>,
    selected: usize,
}

impl MenuStage {
    pub fn new(title: &str, identity: Arc<IdentityService>) -> Self {
        Self {
            title: title.to_string(),
            identity,
            keys: KeyMap::default(),
            viewport: Viewport::default(),
            items: default_items(),
            selected: 0,
        }
    }

    pub fn items(&self) -> &[MenuItem] {
        &self.items
    }

    pub fn item(&self, stage: StageId) -> Option<&MenuItem> {
        self.items.iter().find(|item| item.stage == stage)
    }

    fn item_mut(&mut self, stage: StageId) -> Option<&mut MenuItem> {
        self.items.iter_mut().find(|item| item.stage == stage)
    }

    fn apply_status(&mut self, status: &StatusUpdate) {
        match status {
            StatusUpdate::Auth {
                authenticated,
                username,
            } => {
                debug!("Menu auth status: {} {:?}", authenticated, username);
                let suffix = if *authenticated {
                    "(Authenticated)"
                } else {
                    "(Not Authenticated)"
                };
                if let Some(item) = self.item_mut(StageId::Identity) {
                    item.description = format!("{IDENTITY_DESC} {suffix}");
                }
                if let Some(item) = self.item_mut(StageId::Repo) {
                    item.enabled = *authenticated;
                    item.description = format!("{REPO_DESC} {suffix}");
                }
            }
            StatusUpdate::Gpu { nvidia } => {
                if let Some(item) = self.item_mut(StageId::Driver) {
                    item.enabled = *nvidia;
                    item.description = if *nvidia {
                        "Install proprietary drivers for your GPU".to_string()
                    } else {
                        "No NVIDIA GPU detected".to_string()
                    };
                }
            }
            StatusUpdate::RepoPath(path) => {
                if let Some(item) = self.item_mut(StageId::Profile) {
                    item.enabled = !path.as_os_str().is_empty();
                }
            }
            StatusUpdate::StageDone(stage) => {
                if let Some(item) = self.item_mut(*stage) {
                    item.done = true;
                }
            }
        }
    }

    fn handle_key(&mut self, key: &KeyEvent) -> Command {
        if self.keys.quit.matches(key) || self.keys.back.matches(key) {
            return Command::message(Message::Quit);
        }
        if self.keys.up.matches(key) {
            self.selected = self.selected.saturating_sub(1);
        } else if self.keys.down.matches(key) {
            self.selected = (self.selected + 1).min(self.items.len().saturating_sub(1));
        } else if self.keys.enter.matches(key) {
            if let Some(item) = self.items.get(self.selected).filter(|item| item.enabled) {
                return Command::message(Message::StageSelected(item.stage));
            }
        }
        Command::none()
    }
}

impl Stage for MenuStage {
    fn id(&self) -> StageId {
        StageId::Menu
    }

    fn init(&mut self) -> Command {
        let identity = Arc::clone(&self.identity);
        Command::blocking(move || Message::Status(identity.probe()))
    }

    fn update(&mut self, msg: &Message) -> Command {
        if track_resize(&mut self.viewport, msg) {
            return Command::none();
        }
        match msg {
            Message::Key(key) => self.handle_key(key),
            Message::Status(status) => {
                self.apply_status(status);
                Command::none()
            }
            _ => Command::none(),
        }
    }

    fn view(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let mut lines = Vec::new();
        for (i, item) in self.items.iter().enumerate() {
            let marker = if item.done { " ✓" } else { "" };
            let title = if i == self.selected {
                Line::styled(
                    format!("{SELECTED_PREFIX}{}{marker}", item.title),
                    if item.enabled {
                        theme.selected_style()
                    } else {
                        theme.muted_style()
                    },
                )
            } else if item.enabled {
                Line::styled(format!("  {}{marker}", item.title), theme.style())
            } else {
                Line::styled(format!("  {}{marker}", item.title), theme.muted_style())
            };
            lines.push(title);
            lines.push(Line::styled(
                format!("  {}", item.description),
                theme.muted_style(),
            ));
            lines.push(Line::from(""));
        }
        lines.pop();
        draw_panel(frame, area, &self.title, lines, theme);
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn status_bar(&self) -> StatusBarState {
        StatusBarState::from_bindings(
            &[self.keys.up, self.keys.down, self.keys.quit],
            &[self.keys.enter],
        )
    }

    fn wants(&self, status: &StatusUpdate) -> bool {
        matches!(
            status,
            StatusUpdate::Auth { .. }
                | StatusUpdate::Gpu { .. }
                | StatusUpdate::RepoPath(_)
                | StatusUpdate::StageDone(_)
        )
    }

    fn snapshot(&self) -> Box<dyn Stage> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::stages::testing::{enter, esc, key, render, resolve};
    use crate::system::mock::MockExecutor;
    use crossterm::event::KeyCode;
    use std::path::PathBuf;

    fn menu() -> MenuStage {
        let config = IdentityConfig {
            ssh_dir: Some(std::env::temp_dir().join("archsetup-menu-test")),
            ..Default::default()
        };
        let identity = IdentityService::new(Arc::new(MockExecutor::new()), &config);
        MenuStage::new("BAS - Bootstrap All Systems", Arc::new(identity))
    }

    #[test]
    fn test_initial_items() {
        let menu = menu();
        let titles: Vec<_> = menu.items().iter().map(|i| i.title).collect();
        assert_eq!(
            titles,
            ["GitHub Authentication", "Dotfiles Setup", "NVIDIA Drivers", "Machine Profile"]
        );
        let enabled: Vec<_> = menu.items().iter().map(|i| i.enabled).collect();
        assert_eq!(enabled, [true, false, false, false]);
        let screen = render(&menu, 90, 20);
        assert!(screen.contains("» GitHub Authentication"));
        assert!(screen.contains("Checking..."));
    }

    #[test]
    fn test_statuses_enable_items() {
        let mut menu = menu();
        menu.update(&Message::Status(StatusUpdate::Auth {
            authenticated: true,
            username: Some("octocat".into()),
        }));
        menu.update(&Message::Status(StatusUpdate::Gpu { nvidia: false }));
        menu.update(&Message::Status(StatusUpdate::RepoPath(PathBuf::from("/home/me/dots"))));

        assert!(menu.item(StageId::Repo).unwrap().enabled);
        assert!(menu
            .item(StageId::Identity)
            .unwrap()
            .description
            .ends_with("(Authenticated)"));
        let driver = menu.item(StageId::Driver).unwrap();
        assert!(!driver.enabled);
        assert_eq!(driver.description, "No NVIDIA GPU detected");
        assert!(menu.item(StageId::Profile).unwrap().enabled);
    }

    #[test]
    fn test_empty_repo_path_keeps_profile_disabled() {
        let mut menu = menu();
        menu.update(&Message::Status(StatusUpdate::RepoPath(PathBuf::new())));
        assert!(!menu.item(StageId::Profile).unwrap().enabled);
    }

    #[test]
    fn test_stage_done_marks_item() {
        let mut menu = menu();
        menu.update(&Message::Status(StatusUpdate::StageDone(StageId::Identity)));
        assert!(menu.item(StageId::Identity).unwrap().done);
        assert!(render(&menu, 90, 20).contains("GitHub Authentication ✓"));
    }

    #[tokio::test]
    async fn test_enter_selects_only_enabled_items() {
        let mut menu = menu();
        match resolve(menu.update(&enter())).await {
            Message::StageSelected(StageId::Identity) => {}
            other => panic!("unexpected {other:?}"),
        }

        menu.update(&key(KeyCode::Char('j')));
        assert!(menu.update(&enter()).is_none());
    }

    #[tokio::test]
    async fn test_quit_keys() {
        let mut menu = menu();
        assert!(matches!(resolve(menu.update(&esc())).await, Message::Quit));
        assert!(matches!(
            resolve(menu.update(&key(KeyCode::Char('q')))).await,
            Message::Quit
        ));
    }

    #[tokio::test]
    async fn test_init_probes_auth() {
        let mut menu = menu();
        match resolve(menu.init()).await {
            Message::Status(StatusUpdate::Auth { authenticated, .. }) => assert!(!authenticated),
            other => panic!("unexpected {other:?}"),
        }
    }
}
