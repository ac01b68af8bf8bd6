//! The orchestrator: owns every stage and the global navigator, and routes
//! each bus message to the stages that should see it.

use std::sync::Arc;

use ratatui::{prelude::*, widgets::Paragraph, Frame};
use tracing::{debug, info, warn};

use crate::bus::Command;
use crate::config::SetupConfig;
use crate::keys::KeyMap;
use crate::message::{Message, StageId, StagePayload, StatusUpdate};
use crate::navigator::Navigator;
use crate::shield;
use crate::stages::{build_stages, Probe, Stage, MIN_VIEWPORT};
use crate::system::{Executor, OsInfo};
use crate::ui::widgets::{draw_header, draw_status_bar};
use crate::ui::{Layout, Theme};

pub struct App {
    title: String,
    theme: Theme,
    keys: KeyMap,
    nav: Navigator<StageId>,
    /// Broadcast order.
    stages: Vec<Box<dyn Stage>>,
    probes: Vec<Probe>,
    size: (u16, u16),
    should_quit: bool,
}

impl App {
    pub fn new(
        config: &SetupConfig,
        executor: Arc<dyn Executor>,
        os: OsInfo,
        theme: Theme,
    ) -> Self {
        let (stages, probes) = build_stages(config, executor, os);
        Self::with_stages(&config.general.title, stages, probes, theme)
    }

    pub fn with_stages(
        title: &str,
        stages: Vec<Box<dyn Stage>>,
        probes: Vec<Probe>,
        theme: Theme,
    ) -> Self {
        Self {
            title: title.to_string(),
            theme,
            keys: KeyMap::default(),
            nav: Navigator::new(StageId::Menu),
            stages,
            probes,
            size: (0, 0),
            should_quit: false,
        }
    }

    pub fn current(&self) -> StageId {
        self.nav.current()
    }

    pub fn stage(&self, id: StageId) -> Option<&dyn Stage> {
        self.stages.iter().find(|s| s.id() == id).map(|s| s.as_ref())
    }

    fn stage_mut(&mut self, id: StageId) -> Option<&mut Box<dyn Stage>> {
        self.stages.iter_mut().find(|s| s.id() == id)
    }

    pub fn size(&self) -> (u16, u16) {
        self.size
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// Initializes the root stage and fires the startup probes.
    pub fn init(&mut self) -> Command {
        info!("Starting at {}", self.current().short_name());
        let probes = self.probes.iter().map(|probe| {
            let probe = Arc::clone(probe);
            Command::blocking(move || Message::Status(probe()))
        });
        let probes: Vec<Command> = probes.collect();
        Command::batch(std::iter::once(self.init_active()).chain(probes))
    }

    pub fn update(&mut self, msg: Message) -> Command {
        match msg {
            Message::Resize { width, height } => {
                self.size = (width, height);
                let (width, height) = Layout::content_size(width, height);
                debug!("Resize to content {}x{}", width, height);
                self.broadcast(&Message::Resize { width, height })
            }
            Message::Key(key) if self.keys.hard_quit.matches(&key) => {
                info!("Hard quit");
                self.should_quit = true;
                Command::none()
            }
            Message::Quit => {
                info!("Quit requested");
                self.should_quit = true;
                Command::none()
            }
            Message::StageSelected(id) => self.enter(id),
            Message::StageFinished { stage, payload } => self.finish(stage, payload),
            Message::StageCancelled(stage) => self.leave(stage),
            Message::Status(status) => self.deliver(&status),
            Message::CommandFailed { reason } => {
                // The shield already logged the panic itself.
                warn!("Command produced no message: {}", reason);
                Command::none()
            }
            msg => match msg.owner() {
                Some(owner) => self.route(owner, &msg),
                None => self.route(self.current(), &msg),
            },
        }
    }

    fn init_active(&mut self) -> Command {
        let current = self.current();
        match self.stage_mut(current) {
            Some(stage) => shield::init(stage),
            None => {
                warn!("No stage registered for {}", current.short_name());
                Command::none()
            }
        }
    }

    fn route(&mut self, id: StageId, msg: &Message) -> Command {
        match self.stage_mut(id) {
            Some(stage) => shield::update(stage, msg),
            None => Command::none(),
        }
    }

    fn broadcast(&mut self, msg: &Message) -> Command {
        let commands: Vec<Command> = self
            .stages
            .iter_mut()
            .map(|stage| shield::update(stage, msg))
            .collect();
        Command::batch(commands)
    }

    /// Sends `status` to every stage that declares interest in it.
    fn deliver(&mut self, status: &StatusUpdate) -> Command {
        let msg = Message::Status(status.clone());
        let commands: Vec<Command> = self
            .stages
            .iter_mut()
            .filter(|stage| stage.wants(status))
            .map(|stage| shield::update(stage, &msg))
            .collect();
        Command::batch(commands)
    }

    fn enter(&mut self, id: StageId) -> Command {
        if id == StageId::Menu || id == self.current() || self.stage(id).is_none() {
            debug!("Ignoring selection of {}", id.short_name());
            return Command::none();
        }
        info!("Entering {}", id.short_name());
        self.nav.push(id);
        self.init_active()
    }

    fn is_stale(&self, stage: StageId) -> bool {
        if stage != self.current() {
            debug!(
                "Dropping stale lifecycle message from {} (active: {})",
                stage.short_name(),
                self.current().short_name()
            );
            return true;
        }
        false
    }

    fn finish(&mut self, stage: StageId, payload: Option<StagePayload>) -> Command {
        if self.is_stale(stage) {
            return Command::none();
        }
        info!("{} finished", stage.short_name());
        let mut commands = vec![self.deliver(&StatusUpdate::StageDone(stage))];
        if let Some(payload) = payload {
            commands.push(self.deliver(&payload.into_status()));
        }
        self.nav.pop();
        commands.push(self.init_active());
        Command::batch(commands)
    }

    fn leave(&mut self, stage: StageId) -> Command {
        if self.is_stale(stage) {
            return Command::none();
        }
        info!("{} cancelled", stage.short_name());
        self.nav.pop();
        self.init_active()
    }

    pub fn view(&self, frame: &mut Frame) {
        let layout = Layout::new(frame.area());
        draw_header(frame, layout.header, &self.title, &self.theme);

        let Some(active) = self.stage(self.current()) else {
            return;
        };
        if active.viewport().is_too_small() {
            draw_too_small(frame, layout.content, &self.theme);
        } else {
            shield::view(active, frame, layout.content, &self.theme);
        }
        draw_status_bar(frame, layout.status, &active.status_bar(), &self.theme);
    }
}

fn draw_too_small(frame: &mut Frame, area: Rect, theme: &Theme) {
    let text = vec![
        Line::styled("Terminal too small", theme.error_style()),
        Line::styled(
            format!("Need at least {}x{}", MIN_VIEWPORT.width, MIN_VIEWPORT.height),
            theme.muted_style(),
        ),
    ];
    frame.render_widget(Paragraph::new(text).alignment(Alignment::Center), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{enter, resolve_all};
    use crate::stages::{track_resize, Viewport};
    use crate::stages::repo::RepoMsg;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;
    use crate::shield::testing::capture_logs;
    use crate::ui::widgets::StatusBarState;
    use std::path::PathBuf;

    #[derive(Debug, Clone)]
    struct Recorder {
        id: StageId,
        viewport: Viewport,
        seen: Vec<String>,
        explode_on_key: bool,
        explode_on_view: bool,
        wants_auth: bool,
    }

    impl Recorder {
        fn new(id: StageId) -> Self {
            Self {
                id,
                viewport: Viewport::default(),
                seen: Vec::new(),
                explode_on_key: false,
                explode_on_view: false,
                wants_auth: false,
            }
        }

        fn exploding(mut self) -> Self {
            self.explode_on_key = true;
            self
        }

        fn broken_view(mut self) -> Self {
            self.explode_on_view = true;
            self
        }

        fn wanting_auth(mut self) -> Self {
            self.wants_auth = true;
            self
        }
    }

    impl Stage for Recorder {
        fn id(&self) -> StageId {
            self.id
        }

        fn init(&mut self) -> Command {
            self.seen.push("init".to_string());
            Command::none()
        }

        fn update(&mut self, msg: &Message) -> Command {
            if track_resize(&mut self.viewport, msg) {
                return Command::none();
            }
            self.seen.push(format!("{msg:?}"));
            if self.explode_on_key && matches!(msg, Message::Key(_)) {
                panic!("recorder exploded");
            }
            Command::none()
        }

        fn view(&self, frame: &mut Frame, area: Rect, _theme: &Theme) {
            if self.explode_on_view {
                panic!("view exploded");
            }
            frame.render_widget(Paragraph::new(format!("stage {}", self.id.short_name())), area);
        }

        fn viewport(&self) -> Viewport {
            self.viewport
        }

        fn status_bar(&self) -> StatusBarState {
            StatusBarState::new("left hint", "right hint")
        }

        fn wants(&self, status: &StatusUpdate) -> bool {
            match status {
                StatusUpdate::StageDone(_) => self.id == StageId::Menu,
                StatusUpdate::Auth { .. } => self.wants_auth,
                _ => false,
            }
        }

        fn snapshot(&self) -> Box<dyn Stage> {
            Box::new(self.clone())
        }
    }

    fn app_with(stages: Vec<Recorder>) -> App {
        let stages = stages
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn Stage>)
            .collect();
        App::with_stages("test", stages, Vec::new(), Theme::default())
    }

    fn app() -> App {
        app_with(vec![
            Recorder::new(StageId::Menu),
            Recorder::new(StageId::Identity),
            Recorder::new(StageId::Repo),
        ])
    }

    fn seen(app: &App, id: StageId) -> String {
        format!("{:?}", app.stage(id).unwrap())
    }

    fn snapshot_all(app: &App) -> Vec<String> {
        StageId::ALL
            .iter()
            .filter_map(|id| app.stage(*id))
            .map(|s| format!("{s:?}"))
            .collect()
    }

    #[test]
    fn test_selection_pushes_and_inits() {
        let mut app = app();
        let _ = app.update(Message::StageSelected(StageId::Identity));
        assert_eq!(app.current(), StageId::Identity);
        assert!(seen(&app, StageId::Identity).contains("\"init\""));

        // Re-selecting the active stage or selecting an unknown one is a no-op.
        let _ = app.update(Message::StageSelected(StageId::Identity));
        let _ = app.update(Message::StageSelected(StageId::Profile));
        assert_eq!(app.current(), StageId::Identity);
    }

    #[test]
    fn test_cancel_pops_back_to_menu() {
        let mut app = app();
        let _ = app.update(Message::StageSelected(StageId::Repo));
        let _ = app.update(Message::StageCancelled(StageId::Repo));
        assert_eq!(app.current(), StageId::Menu);
        assert!(seen(&app, StageId::Menu).contains("\"init\""));
    }

    #[test]
    fn test_keys_reach_only_the_active_stage() {
        let mut app = app();
        let _ = app.update(Message::StageSelected(StageId::Identity));
        let _ = app.update(enter());
        assert!(seen(&app, StageId::Identity).contains("Key("));
        assert!(!seen(&app, StageId::Menu).contains("Key("));
        assert!(!seen(&app, StageId::Repo).contains("Key("));
    }

    #[test]
    fn test_envelope_messages_reach_their_owner() {
        let mut app = app();
        let _ = app.update(Message::Repo(RepoMsg::Cloned(Ok(()))));
        assert_eq!(app.current(), StageId::Menu);
        assert!(seen(&app, StageId::Repo).contains("Cloned"));
        assert!(!seen(&app, StageId::Menu).contains("Cloned"));
    }

    #[test]
    fn test_hard_quit_from_any_stage() {
        let mut app = app();
        let _ = app.update(Message::StageSelected(StageId::Repo));
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        let _ = app.update(Message::Key(ctrl_c));
        assert!(app.should_quit());
        assert!(!seen(&app, StageId::Repo).contains("Key("));
    }

    #[test]
    fn test_quit_message() {
        let mut app = app();
        assert!(!app.should_quit());
        let _ = app.update(Message::Quit);
        assert!(app.should_quit());
    }

    #[test]
    fn test_resize_reaches_background_stages() {
        let mut app = app();
        let _ = app.update(Message::StageSelected(StageId::Repo));
        let _ = app.update(Message::Resize {
            width: 100,
            height: 40,
        });
        assert_eq!(app.size(), (100, 40));

        let _ = app.update(Message::StageCancelled(StageId::Repo));
        let _ = app.update(Message::StageSelected(StageId::Identity));
        let viewport = app.stage(StageId::Identity).unwrap().viewport();
        assert_eq!(
            viewport,
            Viewport {
                width: 96,
                height: 36
            }
        );

        let mut terminal = Terminal::new(TestBackend::new(100, 40)).unwrap();
        terminal.draw(|frame| app.view(frame)).unwrap();
        let text: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(text.contains("stage identity"));
        assert!(!text.contains("Terminal too small"));
    }

    #[test]
    fn test_small_terminal_shows_notice() {
        let mut app = app();
        let _ = app.update(Message::Resize {
            width: 30,
            height: 6,
        });
        let mut terminal = Terminal::new(TestBackend::new(30, 6)).unwrap();
        terminal.draw(|frame| app.view(frame)).unwrap();
        let text: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(text.contains("Terminal too small"));
        assert!(!text.contains("stage menu"));
    }

    #[test]
    fn test_finish_fans_out_payload_to_interested_stages() {
        let mut app = app_with(vec![
            Recorder::new(StageId::Menu).wanting_auth(),
            Recorder::new(StageId::Identity),
            Recorder::new(StageId::Repo).wanting_auth(),
            Recorder::new(StageId::Driver),
        ]);
        let _ = app.update(Message::StageSelected(StageId::Identity));
        let _ = app.update(Message::StageFinished {
            stage: StageId::Identity,
            payload: Some(StagePayload::Authenticated {
                username: "octocat".into(),
            }),
        });

        assert_eq!(app.current(), StageId::Menu);
        let menu = seen(&app, StageId::Menu);
        assert!(menu.contains("StageDone(Identity)"));
        assert!(menu.contains("octocat"));
        assert!(seen(&app, StageId::Repo).contains("octocat"));
        assert!(!seen(&app, StageId::Repo).contains("StageDone"));
        assert!(!seen(&app, StageId::Driver).contains("Status("));
    }

    #[test]
    fn test_stale_finish_is_dropped() {
        let mut app = app();
        let _ = app.update(Message::StageSelected(StageId::Identity));
        let before = snapshot_all(&app);
        let _ = app.update(Message::StageFinished {
            stage: StageId::Repo,
            payload: Some(StagePayload::RepoPath(PathBuf::from("/tmp/dots"))),
        });
        let _ = app.update(Message::StageCancelled(StageId::Repo));
        assert_eq!(app.current(), StageId::Identity);
        assert_eq!(snapshot_all(&app), before);
    }

    #[test]
    fn test_panicking_update_leaves_every_stage_unchanged() {
        let mut app = app_with(vec![
            Recorder::new(StageId::Menu),
            Recorder::new(StageId::Identity).exploding(),
            Recorder::new(StageId::Repo),
        ]);
        let _ = app.update(Message::StageSelected(StageId::Identity));
        let before = snapshot_all(&app);

        let (logs, _guard) = capture_logs();
        let cmd = app.update(enter());

        assert!(cmd.is_none());
        assert_eq!(snapshot_all(&app), before);
        assert_eq!(app.current(), StageId::Identity);
        let logged = logs.contents();
        assert_eq!(logged.matches("Contained panic in").count(), 1, "{logged}");
        assert!(logged.contains("recorder exploded"));
        assert!(logged.contains("ERROR"));
    }

    #[test]
    fn test_panicking_view_keeps_header_and_status_bar() {
        crate::shield::install_panic_hook(|| {});
        let mut app = app_with(vec![Recorder::new(StageId::Menu).broken_view()]);
        let _ = app.update(Message::Resize {
            width: 60,
            height: 12,
        });
        let (logs, _guard) = capture_logs();

        let mut terminal = Terminal::new(TestBackend::new(60, 12)).unwrap();
        terminal.draw(|frame| app.view(frame)).unwrap();
        let buffer = terminal.backend().buffer();
        let row = |y: u16| -> String { (0..60).map(|x| buffer[(x, y)].symbol()).collect() };

        assert!(row(0).contains("test"));
        assert!(row(11).contains("left hint"));
        assert!(row(11).contains("right hint"));
        assert_eq!(logs.contents().matches("Contained panic in").count(), 1);
    }

    #[tokio::test]
    async fn test_init_runs_probes() {
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(Recorder::new(StageId::Menu))];
        let probe: Probe = Arc::new(|| StatusUpdate::Gpu { nvidia: true });
        let mut app = App::with_stages("test", stages, vec![probe], Theme::default());

        let messages = resolve_all(app.init()).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            Message::Status(StatusUpdate::Gpu { nvidia: true })
        ));
        assert!(seen(&app, StageId::Menu).contains("\"init\""));
    }
}
