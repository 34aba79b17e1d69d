use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use lora_rekey::cli::{self, commands, ApplyCommand, ConvertCommand, ListCommand};
use lora_rekey::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "lora-rekey",
    version,
    about = "Convert trainer-style LoRA weights to host-compatible keys in memory",
    long_about = "Renames LoRA keys, fuses separate q/k/v adapters into qkv projections and \
                  folds alpha into lora_A/lora_B factors, without rewriting files on disk."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Use JSON output format
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file path (json, yaml or toml)
    #[arg(short, long, global = true, env = "LORA_REKEY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List adapters in the adapter directory
    List(ListCommand),

    /// Convert an adapter in memory and report the result
    Convert(ConvertCommand),

    /// Apply an adapter to a base model in memory
    Apply(ApplyCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to build default configuration".to_string(),
    })?;

    cli::logging::init_logging(cli.verbose, cli.quiet, cli.json, &config.logging)?;

    let ctx = cli::Context {
        json: cli.json,
        quiet: cli.quiet,
        config,
    };

    match cli.command {
        Commands::List(cmd) => commands::list::execute(cmd, &ctx),
        Commands::Convert(cmd) => commands::convert::execute(cmd, &ctx),
        Commands::Apply(cmd) => commands::apply::execute(cmd, &ctx),
    }
}
