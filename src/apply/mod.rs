//! Loading adapters and handing them to the host
//!
//! [`LoraLoader`] is the node-level entry point: it reads an adapter from an
//! [`AdapterSource`], converts it with the configured [`LoraConverter`] and
//! passes the result to a [`LoraPatcher`] together with the user's strength.

pub mod loader;
pub mod merger;

pub use loader::{load_safetensors, SafetensorsDirectory};
pub use merger::{MergePlan, MergeTarget, PatchedModel, WeightMerger};

use tracing::{debug, info, instrument};

use crate::config::{ConversionConfig, MAX_STRENGTH};
use crate::error::{Error, Result};
use crate::lora::{converter_for, Converted, LoraConverter};
use crate::weights::WeightDict;

/// Somewhere adapters can be listed and read from
pub trait AdapterSource {
    /// Names of the available adapters, sorted
    fn list(&self) -> Result<Vec<String>>;

    /// Read one adapter into memory
    fn load(&self, name: &str) -> Result<WeightDict>;
}

/// Host routine that applies a converted adapter to a model
pub trait LoraPatcher {
    /// Model handle understood by the host
    type Model;

    /// Return a patched model, leaving `model` untouched
    fn apply_lora(
        &self,
        model: &Self::Model,
        lora: &WeightDict,
        strength: f64,
    ) -> Result<Self::Model>;
}

/// Check that a strength is usable
pub fn validate_strength(strength: f64) -> Result<()> {
    if !strength.is_finite() || strength.abs() > MAX_STRENGTH {
        return Err(Error::invalid_input(format!(
            "Strength must be within [-{MAX_STRENGTH}, {MAX_STRENGTH}], got {strength}"
        )));
    }
    Ok(())
}

/// Loads, converts and applies adapters
pub struct LoraLoader<S> {
    source: S,
    converter: Box<dyn LoraConverter>,
}

impl<S: AdapterSource> LoraLoader<S> {
    /// Create a loader with an explicit converter
    pub fn new(source: S, converter: Box<dyn LoraConverter>) -> Self {
        Self { source, converter }
    }

    /// Create a loader using the converter selected by `config`
    pub fn from_config(source: S, config: &ConversionConfig) -> Result<Self> {
        Ok(Self::new(source, converter_for(config)?))
    }

    /// Adapter source backing this loader
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Read and convert an adapter without applying it
    #[instrument(skip(self))]
    pub fn convert(&self, lora_name: &str) -> Result<Converted> {
        let weights = self.source.load(lora_name)?;
        debug!("Read {} tensors from {}", weights.len(), lora_name);
        self.converter.convert(&weights)
    }

    /// Apply `lora_name` to `model` at `strength`
    ///
    /// A strength of exactly zero returns `model` unchanged without reading
    /// or converting anything.
    pub fn load<P: LoraPatcher>(
        &self,
        patcher: &P,
        model: P::Model,
        lora_name: &str,
        strength: f64,
    ) -> Result<P::Model> {
        if strength == 0.0 {
            return Ok(model);
        }
        validate_strength(strength)?;

        let converted = self.convert(lora_name)?;
        info!(
            "Applying {} ({} tensors, {}) at strength {}",
            lora_name,
            converted.weights.len(),
            converted.report.strategy,
            strength
        );
        patcher.apply_lora(&model, &converted.weights, strength)
    }
}
