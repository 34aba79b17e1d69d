//! `list`: enumerate adapters

use anyhow::{Context as _, Result};
use clap::Args;
use std::path::PathBuf;

use super::adapter_source;
use crate::apply::AdapterSource;
use crate::cli::{logging, Context};

/// Arguments of `list`
#[derive(Args, Debug)]
pub struct ListCommand {
    /// Adapter directory, overriding the configured one
    #[arg(short = 'd', long = "dir")]
    pub dir: Option<PathBuf>,
}

/// List the adapters in the adapter directory
pub fn execute(cmd: ListCommand, ctx: &Context) -> Result<()> {
    let source = adapter_source(&ctx.config.loader, cmd.dir)?;
    let names = source
        .list()
        .with_context(|| format!("Failed to list adapters in {}", source.root().display()))?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else if names.is_empty() {
        logging::warning(&format!("No adapters found in {}", source.root().display()));
    } else {
        for name in &names {
            println!("{name}");
        }
    }

    Ok(())
}
