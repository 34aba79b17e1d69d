//! `apply`: merge an adapter into base weights in memory

use anyhow::{Context as _, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

use super::adapter_source;
use crate::apply::{load_safetensors, LoraLoader, PatchedModel, WeightMerger};
use crate::cli::{logging, Context};
use crate::config::ConversionStrategy;

/// Arguments of `apply`
#[derive(Args, Debug)]
pub struct ApplyCommand {
    /// Base model safetensors file
    pub base: PathBuf,

    /// Adapter file name inside the adapter directory
    pub lora: String,

    /// Adapter strength, defaults to the configured strength
    #[arg(short = 's', long = "strength", allow_negative_numbers = true)]
    pub strength: Option<f64>,

    /// Converter to use, overriding the configured one
    #[arg(long = "strategy", value_enum)]
    pub strategy: Option<ConversionStrategy>,

    /// Adapter directory, overriding the configured one
    #[arg(short = 'd', long = "dir")]
    pub dir: Option<PathBuf>,
}

/// Apply an adapter to a base model and print the merge summary
pub fn execute(cmd: ApplyCommand, ctx: &Context) -> Result<()> {
    let strength = cmd.strength.unwrap_or(ctx.config.loader.default_strength);
    let mut conversion = ctx.config.conversion.clone();
    if let Some(strategy) = cmd.strategy {
        conversion.strategy = strategy;
    }

    let source = adapter_source(&ctx.config.loader, cmd.dir)?;
    let device = ctx.config.loader.device.to_device()?;
    let loader = LoraLoader::from_config(source, &conversion)?;
    let merger = WeightMerger::from_config(&conversion);

    let progress = ctx.progress(&format!("Reading {}", cmd.base.display()));
    let base = load_safetensors(&cmd.base, &device)
        .with_context(|| format!("Failed to read base model {}", cmd.base.display()));
    let base = match base {
        Ok(base) => base,
        Err(err) => {
            progress.finish_and_clear();
            return Err(err);
        }
    };

    progress.set_message(&format!("Applying {}", cmd.lora));
    let patched = loader
        .load(&merger, PatchedModel::from(base), &cmd.lora, strength)
        .with_context(|| format!("Failed to apply {}", cmd.lora));
    progress.finish_and_clear();
    let patched = patched?;

    let plan = &patched.applied;
    info!("Patched model holds {} tensors", patched.weights.len());

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }

    if strength == 0.0 {
        logging::info("Strength is 0, model left unchanged");
        return Ok(());
    }
    logging::success(&format!(
        "Applied {} at strength {}: {} groups patched",
        cmd.lora,
        strength,
        plan.targets.len()
    ));
    if !plan.is_complete() {
        let unresolved = plan.unresolved.len();
        logging::warning(&format!("{unresolved} groups did not match any base weight:"));
        for group in &plan.unresolved {
            println!("    {group}");
        }
    }

    Ok(())
}
