use std::path::PathBuf;

use crossterm::event::KeyEvent;

use crate::stages::driver::DriverMsg;
use crate::stages::identity::IdentityMsg;
use crate::stages::profile::ProfileMsg;
use crate::stages::repo::RepoMsg;

/// Global phase: which stage currently owns the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    Menu,
    Identity,
    Repo,
    Driver,
    Profile,
}

impl StageId {
    /// Broadcast order.
    pub const ALL: [StageId; 5] = [
        StageId::Menu,
        StageId::Identity,
        StageId::Repo,
        StageId::Driver,
        StageId::Profile,
    ];

    pub fn short_name(&self) -> &'static str {
        match self {
            StageId::Menu => "menu",
            StageId::Identity => "identity",
            StageId::Repo => "repo",
            StageId::Driver => "driver",
            StageId::Profile => "profile",
        }
    }
}

/// Result carried by a stage that finished successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagePayload {
    Authenticated { username: String },
    RepoPath(PathBuf),
}

impl StagePayload {
    pub fn into_status(self) -> StatusUpdate {
        match self {
            StagePayload::Authenticated { username } => StatusUpdate::Auth {
                authenticated: true,
                username: Some(username),
            },
            StagePayload::RepoPath(path) => StatusUpdate::RepoPath(path),
        }
    }
}

/// Cross-cutting status, delivered to every stage that asks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Auth {
        authenticated: bool,
        username: Option<String>,
    },
    Gpu { nvidia: bool },
    RepoPath(PathBuf),
    StageDone(StageId),
}

#[derive(Debug, Clone)]
pub enum Message {
    Key(KeyEvent),
    /// Outer terminal size, or the content size once the orchestrator has
    /// forwarded it to the stages.
    Resize { width: u16, height: u16 },
    Tick,
    Quit,

    StageSelected(StageId),
    StageFinished {
        stage: StageId,
        payload: Option<StagePayload>,
    },
    StageCancelled(StageId),

    Status(StatusUpdate),

    Identity(IdentityMsg),
    Repo(RepoMsg),
    Driver(DriverMsg),
    Profile(ProfileMsg),

    /// A command's task panicked or was aborted before producing its message.
    CommandFailed { reason: String },
}

impl Message {
    /// Stage that owns a stage-envelope message.
    pub fn owner(&self) -> Option<StageId> {
        match self {
            Message::Identity(_) => Some(StageId::Identity),
            Message::Repo(_) => Some(StageId::Repo),
            Message::Driver(_) => Some(StageId::Driver),
            Message::Profile(_) => Some(StageId::Profile),
            _ => None,
        }
    }
}
