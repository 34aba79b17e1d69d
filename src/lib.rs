//! lora-rekey - in-memory conversion of trainer-style LoRA weights
//!
//! LoRA files written by musubi-tuner style trainers store separate
//! `to_q`/`to_k`/`to_v` adapters under flattened `lora_unet_*` names, while
//! the host applies fused `qkv` projections under dotted module paths. This
//! crate rewrites such a weight dictionary into the host convention before it
//! is applied, without touching the file on disk.
//!
//! ```no_run
//! use candle_core::Device;
//! use lora_rekey::{Config, LoraLoader, PatchedModel, SafetensorsDirectory, WeightMerger};
//!
//! # fn main() -> lora_rekey::Result<()> {
//! let config = Config::default();
//! let source = SafetensorsDirectory::new("models/loras", Device::Cpu);
//! let loader = LoraLoader::from_config(source, &config.conversion)?;
//!
//! let base = lora_rekey::apply::load_safetensors("model.safetensors".as_ref(), &Device::Cpu)?;
//! let model = PatchedModel::from(base);
//! let patched = loader.load(&WeightMerger::default(), model, "style.safetensors", 0.8)?;
//! println!("{} groups patched", patched.applied.targets.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod apply;
pub mod cli;
pub mod config;
pub mod error;
pub mod lora;
pub mod weights;

// Re-exports
pub use apply::{
    AdapterSource, LoraLoader, LoraPatcher, PatchedModel, SafetensorsDirectory, WeightMerger,
};
pub use config::{Config, ConversionConfig, ConversionStrategy};
pub use error::{Error, Result};
pub use lora::{
    converter_for, ConversionReport, Converted, DiffusersConverter, DirectRenameConverter,
    LoraConverter,
};
pub use weights::WeightDict;
