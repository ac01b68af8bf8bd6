mod input;
mod layout;
mod theme;
pub mod widgets;

pub use input::InputBuffer;
pub use layout::Layout;
pub use theme::Theme;
