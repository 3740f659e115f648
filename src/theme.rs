//! Terminal colors for CLI output.
//!
//! Colors are disabled by `--no-color` or the `NO_COLOR` environment variable.

use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally. Call early in `main()`.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Semantic styles for summary output.
pub trait Themed: std::fmt::Display {
    /// File paths (cyan).
    fn path_style(&self) -> String {
        if colors_enabled() {
            self.to_string().cyan().to_string()
        } else {
            self.to_string()
        }
    }

    /// Counts and sizes (bold).
    fn count_style(&self) -> String {
        if colors_enabled() {
            self.to_string().bold().to_string()
        } else {
            self.to_string()
        }
    }

    /// Warnings (yellow).
    fn warning(&self) -> String {
        if colors_enabled() {
            self.to_string().yellow().to_string()
        } else {
            self.to_string()
        }
    }

    /// Success messages (green + bold).
    fn success(&self) -> String {
        if colors_enabled() {
            self.to_string().green().bold().to_string()
        } else {
            self.to_string()
        }
    }
}

impl<T: std::fmt::Display + ?Sized> Themed for T {}
