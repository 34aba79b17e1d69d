//! Direct-rename converter
//!
//! Keeps the flattened `lora_unet_*` group names, applies the key pattern
//! table and fuses separate q/k/v adapters into the host's single `qkv`
//! projection.

use tracing::{debug, info, instrument, warn};

use super::fusion::{fuse_qkv, LoraPair};
use super::tables::{KeyPatternTable, QkvVariant, QKV_VARIANTS};
use super::{ConversionReport, Converted, LoraConverter, ALPHA, LORA_DOWN, LORA_UP};
use crate::config::ConversionStrategy;
use crate::error::Result;
use crate::weights::{group_name, WeightDict};

/// Renames keys by substring and fuses QKV groups
#[derive(Debug, Clone)]
pub struct DirectRenameConverter {
    table: KeyPatternTable,
    variants: Vec<QkvVariant>,
}

impl Default for DirectRenameConverter {
    fn default() -> Self {
        Self::new(KeyPatternTable::default(), QKV_VARIANTS.to_vec())
    }
}

impl DirectRenameConverter {
    /// Create a converter from explicit tables
    pub fn new(table: KeyPatternTable, variants: Vec<QkvVariant>) -> Self {
        Self { table, variants }
    }

    /// Apply the key pattern table, returning the number of moved entries
    fn rename_keys(&self, weights: &mut WeightDict) -> Result<usize> {
        let mut renamed = 0;

        for key in weights.keys() {
            let Some(new_key) = self.table.rename(&key) else {
                continue;
            };
            if new_key != key {
                let tensor = weights.take(&key)?;
                debug!("Renamed {} -> {}", key, new_key);
                weights.insert(new_key, tensor);
                renamed += 1;
            }
        }

        Ok(renamed)
    }

    /// Fuse every QKV group, returning the number of groups processed
    fn fuse_groups(&self, weights: &mut WeightDict) -> Result<usize> {
        let mut fused = 0;

        for key in weights.keys() {
            // The first variant claiming a key owns it, even when it does not fuse.
            let Some(variant) = self.variants.iter().find(|v| v.claims(&key)) else {
                continue;
            };
            if !key.contains(variant.query()) || !key.contains(LORA_UP) {
                continue;
            }

            fuse_group(weights, variant, group_name(&key))?;
            fused += 1;
        }

        Ok(fused)
    }
}

/// Replace the three member groups of `query_group` with one fused group
fn fuse_group(weights: &mut WeightDict, variant: &QkvVariant, query_group: &str) -> Result<()> {
    let prefix = query_group.replace(variant.query(), "");
    let [q, k, v] = variant.members;

    let query = take_pair(weights, &prefix, q)?;
    let key = take_pair(weights, &prefix, k)?;
    let value = take_pair(weights, &prefix, v)?;

    let alpha = weights.take(&format!("{query_group}.{ALPHA}"))?;
    // Key and value alphas are dropped unchecked; only the query alpha carries over.
    weights.take(&format!("{prefix}{k}.{ALPHA}"))?;
    weights.take(&format!("{prefix}{v}.{ALPHA}"))?;

    let fused = fuse_qkv(query, key, value, Some(&alpha))?;

    let fused_group = format!("{prefix}{}", variant.fused);
    debug!("Fused {} group {}", variant.name, fused_group);
    weights.insert(format!("{fused_group}.{LORA_DOWN}.weight"), fused.down);
    weights.insert(format!("{fused_group}.{LORA_UP}.weight"), fused.up);
    if let Some(alpha) = fused.alpha {
        weights.insert(format!("{fused_group}.{ALPHA}"), alpha);
    }

    Ok(())
}

fn take_pair(weights: &mut WeightDict, prefix: &str, member: &str) -> Result<LoraPair> {
    let down = weights.take(&format!("{prefix}{member}.{LORA_DOWN}.weight"))?;
    let up = weights.take(&format!("{prefix}{member}.{LORA_UP}.weight"))?;
    Ok(LoraPair::new(down, up))
}

impl LoraConverter for DirectRenameConverter {
    fn strategy(&self) -> ConversionStrategy {
        ConversionStrategy::Direct
    }

    #[instrument(skip_all, fields(tensors = weights.len()))]
    fn convert(&self, weights: &WeightDict) -> Result<Converted> {
        info!("Converting LoRA with direct key renames");

        let mut converted = weights.clone();
        let mut report = ConversionReport::new(self.strategy());

        report.renamed = self.rename_keys(&mut converted)?;
        report.fused = self.fuse_groups(&mut converted)?;

        if report.is_noop() {
            warn!("This LoRA does not need to be converted to the host format");
            report.passed_through = converted.len();
        } else {
            info!("Direct key renames applied: {}", report.renamed);
            info!("QKV LoRA layers processed: {}", report.fused);
        }

        Ok(Converted {
            weights: converted,
            report,
        })
    }
}
