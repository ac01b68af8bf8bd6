use ratatui::{
    prelude::*,
    widgets::Paragraph,
};

use crate::keys::Binding;
use crate::ui::Theme;

/// Key hints shown on the bottom row. Each stage publishes its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusBarState {
    pub left_hint: String,
    pub right_hint: String,
}

impl StatusBarState {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left_hint: left.into(),
            right_hint: right.into(),
        }
    }

    pub fn from_bindings(left: &[Binding], right: &[Binding]) -> Self {
        let join = |bindings: &[Binding]| {
            bindings
                .iter()
                .map(Binding::hint)
                .collect::<Vec<_>>()
                .join("  ")
        };
        Self::new(join(left), join(right))
    }

    pub fn busy() -> Self {
        Self::new("Please wait...", "ctrl+c: quit")
    }
}

pub fn draw_status_bar(frame: &mut Frame, area: Rect, state: &StatusBarState, theme: &Theme) {
    let right_width = (state.right_hint.chars().count() as u16).min(area.width);
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(0), Constraint::Length(right_width)])
        .split(area);

    frame.render_widget(
        Paragraph::new(format!(" {}", state.left_hint)).style(theme.muted_style()),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(state.right_hint.as_str()).style(theme.muted_style()),
        chunks[1],
    );
}
