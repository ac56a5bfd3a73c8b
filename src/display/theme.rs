//! Terminal styling for CLI output.

use console::Style;
use owo_colors::OwoColorize;
use std::sync::LazyLock;

use crate::index::FacetHealth;

pub static THEME: LazyLock<Theme> = LazyLock::new(Theme::default);

#[derive(Debug, Clone)]
pub struct Theme {
    pub success: Style,
    pub error: Style,
    pub warning: Style,
    pub header: Style,
    pub dim: Style,
    /// Defect identifiers such as ticket keys
    pub identifier: Style,
    pub number: Style,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            success: Style::new().green().bright(),
            error: Style::new().red().bright(),
            warning: Style::new().yellow().bright(),
            header: Style::new().cyan().bold(),
            dim: Style::new().dim(),
            identifier: Style::new().magenta().bold(),
            number: Style::new().cyan(),
        }
    }
}

impl Theme {
    pub fn success_with_icon(&self, text: &str) -> String {
        if Self::should_disable_colors() {
            format!("✓ {text}")
        } else {
            format!("{} {}", "✓".green(), self.success.apply_to(text))
        }
    }

    pub fn error_with_icon(&self, text: &str) -> String {
        if Self::should_disable_colors() {
            format!("✗ {text}")
        } else {
            format!("{} {}", "✗".red(), self.error.apply_to(text))
        }
    }

    pub fn warning_with_icon(&self, text: &str) -> String {
        if Self::should_disable_colors() {
            format!("⚠ {text}")
        } else {
            format!("{} {}", "⚠".yellow(), self.warning.apply_to(text))
        }
    }

    /// Similarity as a percentage, highlighted when it crosses the duplicate
    /// threshold.
    pub fn similarity(&self, similarity: f32, threshold: f32) -> String {
        let text = format!("{:.1}%", similarity * 100.0);
        if similarity >= threshold {
            self.apply(&self.success, format!("{text} dup"))
        } else {
            self.apply(&self.number, text)
        }
    }

    pub fn health(&self, health: &FacetHealth) -> String {
        match health {
            FacetHealth::Ready { .. } => self.apply(&self.success, "ready"),
            FacetHealth::Empty => self.apply(&self.dim, "empty"),
            FacetHealth::Unavailable { .. } => self.apply(&self.error, "unavailable"),
        }
    }

    /// Check if color output should be disabled.
    pub fn should_disable_colors() -> bool {
        use is_terminal::IsTerminal;
        std::env::var("NO_COLOR").is_ok() || !std::io::stdout().is_terminal()
    }

    /// Apply theme styling conditionally based on terminal support.
    pub fn apply<T: std::fmt::Display>(&self, style: &Style, text: T) -> String {
        if Self::should_disable_colors() {
            text.to_string()
        } else {
            style.apply_to(text).to_string()
        }
    }
}
