//! `convert`: read an adapter and report what conversion does to it

use anyhow::{Context as _, Result};
use clap::Args;
use colored::*;
use serde::Serialize;
use std::path::PathBuf;

use super::adapter_source;
use crate::apply::LoraLoader;
use crate::cli::{logging, Context};
use crate::config::ConversionStrategy;
use crate::lora::ConversionReport;

/// Arguments of `convert`
#[derive(Args, Debug)]
pub struct ConvertCommand {
    /// Adapter file name inside the adapter directory
    pub lora: String,

    /// Converter to use, overriding the configured one
    #[arg(short = 's', long = "strategy", value_enum)]
    pub strategy: Option<ConversionStrategy>,

    /// Fuse to_q/to_k/to_v into qkv with the diffusers strategy
    #[arg(long = "fuse-qkv")]
    pub fuse_qkv: bool,

    /// Print every output key with its shape
    #[arg(long = "show-keys")]
    pub show_keys: bool,

    /// Adapter directory, overriding the configured one
    #[arg(short = 'd', long = "dir")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ConvertOutput {
    lora: String,
    tensors: usize,
    report: ConversionReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    keys: Option<Vec<KeyInfo>>,
}

#[derive(Debug, Serialize)]
struct KeyInfo {
    key: String,
    shape: Vec<usize>,
    dtype: String,
}

/// Convert an adapter in memory and print the report
pub fn execute(cmd: ConvertCommand, ctx: &Context) -> Result<()> {
    let mut conversion = ctx.config.conversion.clone();
    if let Some(strategy) = cmd.strategy {
        conversion.strategy = strategy;
    }
    conversion.fuse_qkv |= cmd.fuse_qkv;

    let source = adapter_source(&ctx.config.loader, cmd.dir)?;
    let loader = LoraLoader::from_config(source, &conversion)?;

    let progress = ctx.progress(&format!("Converting {}", cmd.lora));
    let converted = loader
        .convert(&cmd.lora)
        .with_context(|| format!("Failed to convert {}", cmd.lora));
    progress.finish_and_clear();
    let converted = converted?;

    let keys = cmd.show_keys.then(|| {
        converted
            .weights
            .iter()
            .map(|(key, tensor)| KeyInfo {
                key: key.clone(),
                shape: tensor.dims().to_vec(),
                dtype: format!("{:?}", tensor.dtype()),
            })
            .collect::<Vec<_>>()
    });
    let output = ConvertOutput {
        lora: cmd.lora,
        tensors: converted.weights.len(),
        report: converted.report,
        keys,
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_output(&output);
    }

    Ok(())
}

fn print_output(output: &ConvertOutput) {
    let report = &output.report;
    logging::success(&format!(
        "Converted {} with the {} strategy: {} tensors",
        output.lora, report.strategy, output.tensors
    ));

    println!("  {:<16} {}", "renamed".bold(), report.renamed);
    println!("  {:<16} {}", "emitted".bold(), report.emitted);
    println!("  {:<16} {}", "fused".bold(), report.fused);
    println!("  {:<16} {}", "scaled".bold(), report.scaled);
    if report.passed_through > 0 {
        println!("  {:<16} {}", "passed through".bold(), report.passed_through);
    }
    if !report.unscaled_groups.is_empty() {
        let unscaled = report.unscaled_groups.len();
        logging::warning(&format!("{unscaled} groups left unscaled (no alpha)"));
    }
    if !report.skipped_keys.is_empty() {
        logging::warning(&format!("{} keys skipped:", report.skipped_keys.len()));
        for key in &report.skipped_keys {
            println!("    {}", key.dimmed());
        }
    }

    if let Some(keys) = &output.keys {
        for info in keys {
            println!("{} {:?} {}", info.key, info.shape, info.dtype.dimmed());
        }
    }
}
