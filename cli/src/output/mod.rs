//! Console output with quiet-mode support.
//!
//! Task output from concurrent provisioning tasks interleaves line by line;
//! each line is printed atomically with its task label so the transcript
//! stays attributable.

pub mod progress;
pub mod styles;

use console::Term;
use owo_colors::OwoColorize as _;
pub use styles::Styles;

/// Line-oriented console shared by the orchestrator, hosts, and tasks.
#[derive(Clone)]
pub struct Console {
    styles: Styles,
    is_tty: bool,
    quiet: bool,
}

impl Console {
    /// Create a console based on CLI flags and environment.
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        let is_tty = Term::stdout().is_term();
        let use_colors = is_tty && std::env::var("NO_COLOR").is_err();

        let mut styles = Styles::default();
        if use_colors {
            styles.colorize();
        }

        Self {
            styles,
            is_tty,
            quiet,
        }
    }

    /// Whether spinners should be shown.
    #[must_use]
    pub fn show_progress(&self) -> bool {
        self.is_tty && !self.quiet
    }

    /// Print a progress line. Suppressed when `quiet`.
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{msg}");
        }
    }

    /// Print a line regardless of `quiet` (summaries, results).
    pub fn always(&self, msg: &str) {
        println!("{msg}");
    }

    /// Print a success message prefixed with `✓`. Suppressed when `quiet`.
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{} {msg}", "✓".style(self.styles.success));
        }
    }

    /// Print a warning message prefixed with `⚠`. Suppressed when `quiet`.
    pub fn warn(&self, msg: &str) {
        if !self.quiet {
            println!("{} {msg}", "⚠".style(self.styles.warning));
        }
    }

    /// Print an error message prefixed with `✗` to stderr. Never suppressed.
    pub fn error(&self, msg: &str) {
        eprintln!("{} {msg}", "✗".style(self.styles.error));
    }

    /// Print a section header. Suppressed when `quiet`.
    pub fn header(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.style(self.styles.header));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_console_suppresses_progress_indicators() {
        let console = Console {
            styles: Styles::default(),
            is_tty: true,
            quiet: true,
        };
        assert!(!console.show_progress());
    }

    #[test]
    fn test_non_tty_console_suppresses_progress_indicators() {
        let console = Console {
            styles: Styles::default(),
            is_tty: false,
            quiet: false,
        };
        assert!(!console.show_progress());
    }
}
