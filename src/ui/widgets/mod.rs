mod log_view;
mod status_bar;

pub use log_view::{draw_log, LogBuffer};
pub use status_bar::{draw_status_bar, StatusBarState};

use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};

use super::{Layout, Theme};

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Spinner {
    frame: usize,
}

impl Spinner {
    pub fn tick(&mut self) {
        self.frame = (self.frame + 1) % SPINNER.len();
    }

    pub fn glyph(&self) -> char {
        SPINNER[self.frame]
    }
}

/// Centered bordered panel with wrapped text, the frame every stage screen
/// is drawn in.
pub fn draw_panel(frame: &mut Frame, area: Rect, title: &str, lines: Vec<Line>, theme: &Theme) {
    let width = 72.min(area.width);
    let text_width = width.saturating_sub(4).max(1) as usize;
    let text_rows: usize = lines
        .iter()
        .map(|line| line.width().div_ceil(text_width).max(1))
        .sum();
    let height = (text_rows as u16).saturating_add(4).min(area.height);
    let centered = Layout::centered_box(area, width, height);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(theme.border_style())
        .title(Span::styled(format!(" {} ", title), theme.title_style()));

    let inner = block.inner(centered).inner(ratatui::layout::Margin::new(1, 1));
    frame.render_widget(Clear, centered);
    frame.render_widget(block, centered);
    frame.render_widget(
        Paragraph::new(lines)
            .style(theme.style())
            .wrap(Wrap { trim: false }),
        inner,
    );
}

pub fn draw_header(frame: &mut Frame, area: Rect, title: &str, theme: &Theme) {
    frame.render_widget(
        Paragraph::new(Span::styled(format!(" {}", title), theme.title_style())),
        area,
    );
}
