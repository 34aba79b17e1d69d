//! Command line front end

pub mod commands;
pub mod logging;
/// Terminal progress spinner
pub mod progress;

pub use commands::{ApplyCommand, ConvertCommand, ListCommand};

use crate::config::Config;
use progress::ProgressReporter;

/// Settings shared by every command
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Loaded configuration
    pub config: Config,
    /// Print machine-readable JSON instead of text
    pub json: bool,
    /// Suppress everything but errors
    pub quiet: bool,
}

impl Context {
    /// Spinner for `message`, hidden when output is not for a human
    pub fn progress(&self, message: &str) -> ProgressReporter {
        if self.json || self.quiet {
            ProgressReporter::hidden()
        } else {
            ProgressReporter::new(message)
        }
    }
}
