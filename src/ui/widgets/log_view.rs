use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph},
};

use crate::ui::Theme;

/// Accumulated output of streamed commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBuffer {
    lines: Vec<String>,
}

impl LogBuffer {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The last `rows` lines, oldest first.
    pub fn tail(&self, rows: usize) -> &[String] {
        let start = self.lines.len().saturating_sub(rows);
        &self.lines[start..]
    }
}

/// Bordered box following the end of the log.
pub fn draw_log(frame: &mut Frame, area: Rect, title: &str, log: &LogBuffer, theme: &Theme) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(theme.border_style())
        .title(format!(" {} ", title));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let lines: Vec<Line> = log
        .tail(inner.height as usize)
        .iter()
        .map(|l| Line::from(l.as_str()))
        .collect();
    frame.render_widget(Paragraph::new(lines).style(theme.style()), inner);
}
