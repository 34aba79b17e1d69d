use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner shown while files are read and converted
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Start a spinner with `message`
    pub fn new(message: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            bar.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// A reporter that draws nothing, for quiet or JSON output
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Update the message
    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    /// Finish and remove the spinner
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}
