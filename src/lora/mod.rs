//! LoRA key conversion
//!
//! Two converters rewrite a source dictionary into the host convention:
//! [`DirectRenameConverter`] keeps the flattened `lora_unet_*` names and only
//! renames and fuses, while [`DiffusersConverter`] re-keys everything into
//! `lora_A`/`lora_B` form under the host's module paths. Both fuse attention
//! projections through [`fusion::fuse_qkv`].

use serde::{Deserialize, Serialize};

use crate::config::{ConversionConfig, ConversionStrategy};
use crate::error::Result;
use crate::weights::WeightDict;

pub mod diffusers;
pub mod direct;
pub mod fusion;
pub mod tables;

pub use diffusers::DiffusersConverter;
pub use direct::DirectRenameConverter;
pub use fusion::{fuse_qkv, FusedQkv, LoraPair};
pub use tables::{ArchitectureFamily, KeyPatternTable, ReverseModuleMap};

/// Suffix of down-projection factors in the source convention
pub const LORA_DOWN: &str = "lora_down";
/// Suffix of up-projection factors in the source convention
pub const LORA_UP: &str = "lora_up";
/// Suffix of alpha scalars
pub const ALPHA: &str = "alpha";

/// Converts a source weight dictionary into the host convention
pub trait LoraConverter {
    /// Strategy implemented by this converter
    fn strategy(&self) -> ConversionStrategy;

    /// Build a new dictionary in the host convention
    ///
    /// Fails without returning a partial dictionary when a required factor
    /// is missing or factor shapes cannot be fused.
    fn convert(&self, weights: &WeightDict) -> Result<Converted>;
}

/// Output of one conversion call
#[derive(Debug, Clone)]
pub struct Converted {
    /// Dictionary in the host convention
    pub weights: WeightDict,
    /// What happened along the way
    pub report: ConversionReport,
}

/// Counters and diagnostics collected during a conversion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionReport {
    /// Strategy that produced the report
    pub strategy: ConversionStrategy,
    /// Keys renamed by the key pattern table
    pub renamed: usize,
    /// Factor tensors written under a derived module key
    pub emitted: usize,
    /// QKV groups fused
    pub fused: usize,
    /// Tensors scaled by their group alpha
    pub scaled: usize,
    /// Groups without an alpha, left unscaled
    pub unscaled_groups: Vec<String>,
    /// Keys dropped because their prefix or suffix was not recognised
    pub skipped_keys: Vec<String>,
    /// Keys copied through without changes
    pub passed_through: usize,
}

impl ConversionReport {
    /// Create an empty report for `strategy`
    pub fn new(strategy: ConversionStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Whether the conversion changed nothing about the key layout
    pub fn is_noop(&self) -> bool {
        self.renamed == 0 && self.fused == 0 && self.emitted == 0
    }
}

/// Build the converter selected by `config`
pub fn converter_for(config: &ConversionConfig) -> Result<Box<dyn LoraConverter>> {
    config.validate()?;

    let converter: Box<dyn LoraConverter> = match config.strategy {
        ConversionStrategy::Direct => Box::new(DirectRenameConverter::default()),
        ConversionStrategy::Diffusers => Box::new(DiffusersConverter::from_config(config)),
    };
    Ok(converter)
}
