use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::style::Modifier;
use ratatui::text::{Line, Span};

use super::Theme;

/// Single-line text field with a character cursor and a length limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputBuffer {
    content: String,
    cursor: usize,
    limit: usize,
    placeholder: String,
}

impl InputBuffer {
    pub fn new(placeholder: &str, limit: usize) -> Self {
        Self {
            content: String::new(),
            cursor: 0,
            limit,
            placeholder: placeholder.to_string(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    /// Returns false when the limit is reached.
    pub fn insert(&mut self, c: char) -> bool {
        if self.limit > 0 && self.len() >= self.limit {
            return false;
        }
        let byte_pos = self.cursor_byte_position();
        self.content.insert(byte_pos, c);
        self.cursor += 1;
        true
    }

    pub fn delete_back(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        self.remove_at_cursor();
        true
    }

    pub fn delete_forward(&mut self) -> bool {
        if self.cursor >= self.len() {
            return false;
        }
        self.remove_at_cursor();
        true
    }

    pub fn move_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn move_right(&mut self) {
        if self.cursor < self.len() {
            self.cursor += 1;
        }
    }

    pub fn move_start(&mut self) {
        self.cursor = 0;
    }

    pub fn move_end(&mut self) {
        self.cursor = self.len();
    }

    pub fn set(&mut self, value: &str) {
        self.content = if self.limit > 0 {
            value.chars().take(self.limit).collect()
        } else {
            value.to_string()
        };
        self.cursor = self.len();
    }

    /// Applies an editing key. Returns false for keys the field ignores.
    pub fn handle_key(&mut self, key: &KeyEvent) -> bool {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            return match key.code {
                KeyCode::Char('a') => {
                    self.move_start();
                    true
                }
                KeyCode::Char('e') => {
                    self.move_end();
                    true
                }
                _ => false,
            };
        }
        match key.code {
            KeyCode::Char(c) => {
                self.insert(c);
                true
            }
            KeyCode::Backspace => {
                self.delete_back();
                true
            }
            KeyCode::Delete => {
                self.delete_forward();
                true
            }
            KeyCode::Left => {
                self.move_left();
                true
            }
            KeyCode::Right => {
                self.move_right();
                true
            }
            KeyCode::Home => {
                self.move_start();
                true
            }
            KeyCode::End => {
                self.move_end();
                true
            }
            _ => false,
        }
    }

    /// `label: value` with a block cursor when focused, or the placeholder
    /// when empty.
    pub fn render<'a>(&'a self, label: &'a str, focused: bool, theme: &Theme) -> Line<'a> {
        let mut spans = vec![Span::styled(format!("{label}: "), theme.input_style(focused))];
        if self.content.is_empty() && !focused {
            spans.push(Span::styled(self.placeholder.as_str(), theme.muted_style()));
            return Line::from(spans);
        }

        let split = self.cursor_byte_position();
        let (before, rest) = self.content.split_at(split);
        spans.push(Span::styled(before, theme.style()));
        if focused {
            let mut chars = rest.chars();
            let under = chars.next().map(String::from).unwrap_or_else(|| " ".to_string());
            spans.push(Span::styled(under, theme.style().add_modifier(Modifier::REVERSED)));
            spans.push(Span::styled(chars.as_str(), theme.style()));
        } else {
            spans.push(Span::styled(rest, theme.style()));
        }
        Line::from(spans)
    }

    fn remove_at_cursor(&mut self) {
        let byte_pos = self.cursor_byte_position();
        let next_byte_pos = self.content[byte_pos..]
            .char_indices()
            .nth(1)
            .map(|(i, _)| byte_pos + i)
            .unwrap_or(self.content.len());
        self.content.drain(byte_pos..next_byte_pos);
    }

    fn cursor_byte_position(&self) -> usize {
        self.content
            .char_indices()
            .nth(self.cursor)
            .map(|(i, _)| i)
            .unwrap_or(self.content.len())
    }
}
