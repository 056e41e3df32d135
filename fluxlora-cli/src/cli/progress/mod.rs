use crate::cli::error::{CliError, CliResult};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn style(template: &str) -> CliResult<ProgressStyle> {
    ProgressStyle::default_bar()
        .template(template)
        .map_err(|e| CliError::Config(format!("Invalid progress template: {}", e)))
}

/// How much the terminal may draw, from the global `-q` and `--json` flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputMode {
    pub quiet: bool,
    pub json: bool,
}

impl OutputMode {
    pub fn new(quiet: bool, json: bool) -> Self {
        Self { quiet, json }
    }

    /// Whether progress may be drawn on stderr
    pub fn draws_progress(&self) -> bool {
        !self.quiet && !self.json
    }

    /// A spinner, or a hidden reporter when drawing is off
    pub fn spinner(&self, message: &str) -> CliResult<ProgressReporter> {
        if self.draws_progress() {
            ProgressReporter::new(message)
        } else {
            Ok(ProgressReporter::hidden())
        }
    }

    /// A bar with a known total, or a hidden reporter when drawing is off
    pub fn bar(&self, message: &str, total: u64) -> CliResult<ProgressReporter> {
        if self.draws_progress() {
            ProgressReporter::new_with_total(message, total)
        } else {
            Ok(ProgressReporter::hidden())
        }
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter with indeterminate progress
    pub fn new(message: &str) -> CliResult<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(style("{spinner:.cyan} {msg} [{elapsed}]")?.tick_strings(TICKS));
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        Ok(Self { bar })
    }

    /// Create a new progress reporter with a known total
    pub fn new_with_total(message: &str, total: u64) -> CliResult<Self> {
        let bar = ProgressBar::new(total);
        bar.set_style(
            style("{spinner:.cyan} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("█▇▆▅▄▃▂▁  "),
        );
        bar.set_message(message.to_string());

        Ok(Self { bar })
    }

    /// A reporter that draws nothing, for quiet and JSON modes
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Advance progress by 1 and optionally update message
    pub fn advance(&self, message: &str) {
        if !message.is_empty() {
            self.bar.set_message(message.to_string());
        }
        self.bar.inc(1);
    }

    /// Print a line above the bar
    pub fn println(&self, message: &str) {
        self.bar.println(message);
    }

    /// Finish the progress bar and clear it
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn is_hidden(&self) -> bool {
        self.bar.is_hidden()
    }
}
