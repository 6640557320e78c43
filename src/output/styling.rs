//! Terminal colors, picked by what a piece of text means.

use std::fmt::Display;

use console::{style, StyledObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Section and stage titles
    Heading,
    /// Work in progress and neutral counts
    Running,
    Passed,
    Failed,
    /// Labels and secondary text
    Muted,
    Brand,
    /// Prefix of a fatal error
    Fatal,
}

impl Tone {
    /// Passed when nothing failed, Failed otherwise.
    pub fn for_failures(count: usize) -> Self {
        if count == 0 {
            Self::Passed
        } else {
            Self::Failed
        }
    }

    pub fn paint(self, text: impl Display) -> StyledObject<String> {
        let text = style(text.to_string());
        match self {
            Self::Heading => text.bright().underlined(),
            Self::Running => text.bright().yellow(),
            Self::Passed => text.bright().green(),
            Self::Failed => text.bright().red(),
            Self::Muted => text.dim(),
            Self::Brand => text.magenta().bold(),
            Self::Fatal => text.red().bold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tone() {
        assert_eq!(Tone::for_failures(0), Tone::Passed);
        assert_eq!(Tone::for_failures(3), Tone::Failed);
    }

    #[test]
    fn test_paint_keeps_text() {
        console::set_colors_enabled(false);
        assert_eq!(Tone::Fatal.paint("Error:").to_string(), "Error:");
        assert_eq!(Tone::Running.paint(12).to_string(), "12");
    }
}
