//! The sub-wizards composed by the orchestrator.
//!
//! Each stage is a small state machine with its own [`Navigator`] of private
//! phases. Stages never call each other: they talk to the orchestrator by
//! returning commands that resolve to lifecycle messages
//! (`StageFinished`, `StageCancelled`, `StageSelected`).
//!
//! [`Navigator`]: crate::navigator::Navigator

pub mod driver;
pub mod identity;
pub mod menu;
pub mod profile;
pub mod repo;

use std::fmt;
use std::sync::Arc;

use ratatui::Frame;
use ratatui::layout::Rect;

use crate::bus::Command;
use crate::config::SetupConfig;
use crate::message::{Message, StageId, StatusUpdate};
use crate::system::{Executor, OsInfo};
use crate::ui::Theme;
use crate::ui::widgets::StatusBarState;

/// Smallest content area a stage is drawn into.
pub const MIN_VIEWPORT: Viewport = Viewport {
    width: 20,
    height: 5,
};

/// Content size a stage last received through a resize broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewport {
    pub width: u16,
    pub height: u16,
}

impl Viewport {
    pub fn is_too_small(&self) -> bool {
        self.width < MIN_VIEWPORT.width || self.height < MIN_VIEWPORT.height
    }

    /// Rows available to a log view below `chrome` rows of other text.
    pub fn log_rows(&self, chrome: u16) -> u16 {
        self.height.saturating_sub(chrome).max(3)
    }
}

pub trait Stage: fmt::Debug + Send {
    fn id(&self) -> StageId;

    /// Called each time the stage becomes active. Resets the private state.
    fn init(&mut self) -> Command;

    fn update(&mut self, msg: &Message) -> Command;

    fn view(&self, frame: &mut Frame, area: Rect, theme: &Theme);

    fn viewport(&self) -> Viewport;

    fn status_bar(&self) -> StatusBarState {
        StatusBarState::default()
    }

    /// Whether this stage receives the given status broadcast.
    fn wants(&self, _status: &StatusUpdate) -> bool {
        false
    }

    /// Deep copy used to roll back a failed `update`.
    fn snapshot(&self) -> Box<dyn Stage>;
}

/// Status check run once at startup on the blocking pool.
pub type Probe = Arc<dyn Fn() -> StatusUpdate + Send + Sync>;

/// Builds every stage in broadcast order, plus the startup probes that are
/// not covered by the menu's own `init`.
pub fn build_stages(
    config: &SetupConfig,
    executor: Arc<dyn Executor>,
    os: OsInfo,
) -> (Vec<Box<dyn Stage>>, Vec<Probe>) {
    let identity = Arc::new(identity::IdentityService::new(
        Arc::clone(&executor),
        &config.identity,
    ));
    let repo = Arc::new(repo::RepoService::new(
        Arc::clone(&executor),
        &config.identity.host,
    ));
    let driver = Arc::new(driver::DriverService::new(
        Arc::clone(&executor),
        &config.driver,
    ));
    let profile = Arc::new(profile::ProfileService::new(
        Arc::clone(&executor),
        &config.profiles,
        os,
    ));

    let gpu = Arc::clone(&driver);
    let probes: Vec<Probe> = vec![Arc::new(move || gpu.probe())];

    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(menu::MenuStage::new(&config.general.title, Arc::clone(&identity))),
        Box::new(identity::IdentityStage::new(identity)),
        Box::new(repo::RepoStage::new(repo, config.repo.resolve_destination())),
        Box::new(driver::DriverStage::new(driver)),
        Box::new(profile::ProfileStage::new(profile)),
    ];
    (stages, probes)
}

/// Updates `viewport` when `msg` is a resize. Shared by every stage.
pub(crate) fn track_resize(viewport: &mut Viewport, msg: &Message) -> bool {
    if let Message::Resize { width, height } = msg {
        *viewport = Viewport {
            width: *width,
            height: *height,
        };
        true
    } else {
        false
    }
}
