use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    code: KeyCode,
    ctrl: bool,
}

const fn plain(code: KeyCode) -> KeyPress {
    KeyPress { code, ctrl: false }
}

const fn ctrl(c: char) -> KeyPress {
    KeyPress {
        code: KeyCode::Char(c),
        ctrl: true,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Binding {
    keys: &'static [KeyPress],
    help_key: &'static str,
    help: &'static str,
}

impl Binding {
    const fn new(keys: &'static [KeyPress], help_key: &'static str, help: &'static str) -> Self {
        Self {
            keys,
            help_key,
            help,
        }
    }

    /// Control must match exactly so `ctrl+q` is not read as `q`.
    pub fn matches(&self, key: &KeyEvent) -> bool {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        self.keys.iter().any(|k| k.code == key.code && k.ctrl == ctrl)
    }

    pub fn hint(&self) -> String {
        format!("{}: {}", self.help_key, self.help)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyMap {
    pub hard_quit: Binding,
    pub quit: Binding,
    pub up: Binding,
    pub down: Binding,
    pub enter: Binding,
    pub back: Binding,
    pub tab: Binding,
    pub shift_tab: Binding,
}

const HARD_QUIT: &[KeyPress] = &[ctrl('c')];
const QUIT: &[KeyPress] = &[plain(KeyCode::Char('q'))];
const UP: &[KeyPress] = &[
    plain(KeyCode::Up),
    plain(KeyCode::Char('k')),
    plain(KeyCode::Char('w')),
];
const DOWN: &[KeyPress] = &[
    plain(KeyCode::Down),
    plain(KeyCode::Char('j')),
    plain(KeyCode::Char('s')),
];
const ENTER: &[KeyPress] = &[plain(KeyCode::Enter)];
const BACK: &[KeyPress] = &[plain(KeyCode::Esc), plain(KeyCode::Backspace)];
const TAB: &[KeyPress] = &[plain(KeyCode::Tab)];
const SHIFT_TAB: &[KeyPress] = &[plain(KeyCode::BackTab)];

const INPUT_UP: &[KeyPress] = &[plain(KeyCode::Up)];
const INPUT_DOWN: &[KeyPress] = &[plain(KeyCode::Down)];
const INPUT_BACK: &[KeyPress] = &[plain(KeyCode::Esc)];

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            hard_quit: Binding::new(HARD_QUIT, "ctrl+c", "quit"),
            quit: Binding::new(QUIT, "q", "quit"),
            up: Binding::new(UP, "↑/k/w", "up"),
            down: Binding::new(DOWN, "↓/j/s", "down"),
            enter: Binding::new(ENTER, "enter", "select"),
            back: Binding::new(BACK, "esc", "back"),
            tab: Binding::new(TAB, "tab", "next"),
            shift_tab: Binding::new(SHIFT_TAB, "shift+tab", "prev"),
        }
    }
}

impl KeyMap {
    /// Bindings for screens with text inputs: letters and backspace belong
    /// to the input.
    pub fn input_nav(&self) -> Self {
        Self {
            up: Binding::new(INPUT_UP, "↑", "up"),
            down: Binding::new(INPUT_DOWN, "↓", "down"),
            back: Binding::new(INPUT_BACK, "esc", "back"),
            ..*self
        }
    }
}

#[cfg(test)]
pub(crate) fn press(code: KeyCode) -> KeyEvent {
    KeyEvent::new(code, KeyModifiers::NONE)
}
