use std::{fmt::Write, io::IsTerminal, sync::LazyLock};

use clap::builder::styling::{AnsiColor, Effects, Style, Styles};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Whether stdout is an interactive terminal that understands ANSI escapes.
static IS_ANSI_TERMINAL: LazyLock<bool> = LazyLock::new(|| {
    std::io::stdout().is_terminal()
        && std::env::var("TERM").map_or(false, |term| term != "dumb")
        && std::env::var_os("NO_COLOR").is_none()
});

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns a `Styles` object with the default styles for the CLI.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Green.on_default() | Effects::BOLD)
        .invalid(AnsiColor::Red.on_default() | Effects::BOLD)
}

fn apply_style(text: &str, style: &Style, ansi: bool) -> String {
    if !ansi {
        return text.to_string();
    }

    let mut styled = String::with_capacity(text.len() + 20);
    let _ = write!(styled, "{style}");
    styled.push_str(text);
    let _ = write!(styled, "{}", style.render_reset());
    styled
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies the [`styles`] palette to text when stdout is an ANSI terminal.
pub trait AnsiStyles {
    /// Apply header style to text
    fn header(&self) -> String;

    /// Apply literal style to text
    fn literal(&self) -> String;

    /// Apply placeholder style to text
    fn placeholder(&self) -> String;

    /// Apply error style to text
    fn error(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T: AsRef<str> + ?Sized> AnsiStyles for T {
    fn header(&self) -> String {
        apply_style(self.as_ref(), styles().get_header(), *IS_ANSI_TERMINAL)
    }

    fn literal(&self) -> String {
        apply_style(self.as_ref(), styles().get_literal(), *IS_ANSI_TERMINAL)
    }

    fn placeholder(&self) -> String {
        apply_style(self.as_ref(), styles().get_placeholder(), *IS_ANSI_TERMINAL)
    }

    fn error(&self) -> String {
        apply_style(self.as_ref(), styles().get_error(), *IS_ANSI_TERMINAL)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_style_plain_and_ansi() {
        let style = styles();

        assert_eq!(apply_style("layer", style.get_literal(), false), "layer");

        let styled = apply_style("layer", style.get_literal(), true);
        assert!(styled.contains("\x1b[1m"));
        assert!(styled.contains("\x1b[34m"));
        assert!(styled.contains("layer"));
        assert!(styled.ends_with("\x1b[0m"));
    }
}
