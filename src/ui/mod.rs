//! Report rendering: colors and the textual/JSON output.
pub mod output;

use ansi_term::{Colour, Style};

/// The styles used across the reports. The plain variant keeps every field
/// but renders without escape codes, for `--no-colors` or piped output.
#[derive(Clone, Copy, Debug)]
pub struct Palette {
    /// Client-side values.
    pub blue: Style,
    /// Server-side values.
    pub yellow: Style,
    pub cyan: Style,
    pub green: Style,
    /// Warnings inside reports.
    pub magenta: Style,
    pub red: Style,
}

impl Palette {
    pub fn colored() -> Self {
        Self {
            blue: Colour::Blue.normal(),
            yellow: Colour::Yellow.normal(),
            cyan: Colour::Cyan.normal(),
            green: Colour::Green.normal(),
            magenta: Colour::Purple.normal(),
            red: Colour::Red.normal(),
        }
    }

    pub fn plain() -> Self {
        Self {
            blue: Style::default(),
            yellow: Style::default(),
            cyan: Style::default(),
            green: Style::default(),
            magenta: Style::default(),
            red: Style::default(),
        }
    }
}
