use ratatui::layout::{Constraint, Direction, Layout as RatatuiLayout, Margin, Rect};

/// Columns of padding on each side of the content area.
pub const PADDING_X: u16 = 2;
/// Rows of padding above and below the content area.
pub const PADDING_Y: u16 = 1;
const HEADER_ROWS: u16 = 1;
const STATUS_ROWS: u16 = 1;

pub struct Layout {
    pub full: Rect,
    pub header: Rect,
    pub content: Rect,
    pub status: Rect,
}

impl Layout {
    pub fn new(area: Rect) -> Self {
        let chunks = RatatuiLayout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(HEADER_ROWS),
                Constraint::Min(0),
                Constraint::Length(STATUS_ROWS),
            ])
            .split(area);

        Self {
            full: area,
            header: chunks[0],
            content: chunks[1].inner(Margin::new(PADDING_X, PADDING_Y)),
            status: chunks[2],
        }
    }

    /// Size of [`Layout::content`] for a terminal of the given size, without
    /// needing a frame. Used when forwarding resizes to the stages.
    pub fn content_size(width: u16, height: u16) -> (u16, u16) {
        let layout = Self::new(Rect::new(0, 0, width, height));
        (layout.content.width, layout.content.height)
    }

    pub fn centered_box(area: Rect, width: u16, height: u16) -> Rect {
        let horizontal = RatatuiLayout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Fill(1),
                Constraint::Length(width.min(area.width)),
                Constraint::Fill(1),
            ])
            .split(area);

        let vertical = RatatuiLayout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Fill(1),
                Constraint::Length(height.min(area.height)),
                Constraint::Fill(1),
            ])
            .split(horizontal[1]);

        vertical[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_size_removes_chrome_and_padding() {
        assert_eq!(Layout::content_size(100, 40), (96, 36));
    }

    #[test]
    fn test_tiny_terminal_does_not_underflow() {
        assert_eq!(Layout::content_size(3, 2), (0, 0));
    }

    #[test]
    fn test_centered_box_is_clamped() {
        let area = Rect::new(0, 0, 20, 10);
        let rect = Layout::centered_box(area, 50, 4);
        assert_eq!(rect.width, 20);
        assert_eq!(rect.height, 4);
        assert_eq!(rect.y, 3);
    }
}
