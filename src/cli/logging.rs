//! Subscriber setup and user-facing status lines

use anyhow::Result;
use colored::*;
use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Filter directive for the given verbosity, falling back to the configured level
pub fn filter_directive(verbosity: u8, quiet: bool, config: &LoggingConfig) -> String {
    if quiet {
        return "error".to_string();
    }
    match verbosity {
        0 => format!("lora_rekey={},warn", config.level),
        1 => "lora_rekey=debug,info".to_string(),
        2 => "lora_rekey=trace,debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over the verbosity flags unless `quiet` is set.
pub fn init_logging(
    verbosity: u8,
    quiet: bool,
    json_output: bool,
    config: &LoggingConfig,
) -> Result<()> {
    let directive = filter_directive(verbosity, quiet, config);
    let env_filter = if quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    if json_output || config.json_format {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()?;
    } else if io::stderr().is_terminal() {
        let fmt_layer = fmt::layer()
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .event_format(ColoredFormatter)
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    }

    Ok(())
}

/// Colored terminal formatter with local timestamps
struct ColoredFormatter;

impl<S, N> fmt::FormatEvent<S, N> for ColoredFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} ", now.format("%H:%M:%S").to_string().dimmed())?;

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR".red().bold(),
            Level::WARN => "WARN".yellow().bold(),
            Level::INFO => "INFO".green().bold(),
            Level::DEBUG => "DEBUG".blue().bold(),
            Level::TRACE => "TRACE".purple().bold(),
        };
        write!(writer, "{} ", level)?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Print a success line
pub fn success(message: &str) {
    if io::stdout().is_terminal() {
        println!("{} {}", "✓".green().bold(), message);
    } else {
        println!("SUCCESS: {}", message);
    }
}

/// Print an informational line
pub fn info(message: &str) {
    if io::stdout().is_terminal() {
        println!("{} {}", "ℹ".blue().bold(), message);
    } else {
        println!("INFO: {}", message);
    }
}

/// Print a warning line
pub fn warning(message: &str) {
    if io::stdout().is_terminal() {
        eprintln!("{} {}", "⚠".yellow().bold(), message);
    } else {
        eprintln!("WARNING: {}", message);
    }
}
