// ============================================================================
// src/ui.rs – Console output for the front-end commands
// ============================================================================

use console::{style, Style};

/// Front-end presentation. Logs go to tracing; this is what the user reads.
#[derive(Debug, Clone, Default)]
pub struct UX {
    pub quiet: bool,
}

impl UX {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn phase(&self, title: &str) {
        if self.quiet {
            return;
        }
        let rule = "─".repeat(title.chars().count() + 4);
        let frame = Style::new().cyan().bold();
        println!("{}", frame.apply_to(&rule));
        println!("{}", frame.apply_to(format!("  {title}")));
        println!("{}", frame.apply_to(&rule));
    }

    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{} {}", style("[..]").cyan(), msg);
        }
    }

    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{} {}", style("[OK]").green().bold(), msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{} {}", style("[!!]").yellow().bold(), msg);
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{} {}", style("[XX]").red().bold(), style(msg).red());
    }

    /// Aligned key/value block. Printed even when quiet: it is the output.
    pub fn data_panel(&self, title: &str, rows: &[(&str, String)]) {
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        println!("{}", style(title).bold().underlined());
        for (key, value) in rows {
            println!("  {}  {}", style(format!("{key:<width$}")).bold(), value);
        }
    }
}
