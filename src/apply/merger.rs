//! Reference host patcher merging adapters into base weights
//!
//! Understands both key layouts the converters emit:
//!
//! - `{module}.lora_A.weight` / `{module}.lora_B.weight`, alpha already folded
//!   into the factors, targeting `{module}.weight`
//! - `lora_unet_{flattened}.lora_down.weight` / `.lora_up.weight` with an
//!   optional `.alpha`, targeting the base key whose flattened module path
//!   matches
//!
//! and merges `W += strength * scale * up @ down` for every group it can
//! resolve.

use candle_core::{DType, Tensor};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument, warn};

use super::LoraPatcher;
use crate::config::ConversionConfig;
use crate::error::{Error, Result};
use crate::lora::{ALPHA, LORA_DOWN, LORA_UP};
use crate::weights::{scalar_value, WeightDict};

const WEIGHT_SUFFIX: &str = ".weight";
const LORA_A_SUFFIX: &str = ".lora_A.weight";
const LORA_B_SUFFIX: &str = ".lora_B.weight";

/// One adapter group and the base tensor it patches
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeTarget {
    /// Group name in the adapter
    pub group: String,
    /// Base weight key receiving the delta
    pub base_key: String,
    /// Multiplier applied on top of the strength
    pub scale: f64,
}

/// Resolution of adapter groups against a base model
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergePlan {
    /// Groups with a matching base weight
    pub targets: Vec<MergeTarget>,
    /// Groups no base weight matches
    pub unresolved: Vec<String>,
}

impl MergePlan {
    /// Whether every group resolved
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Factor keys of one group
#[derive(Debug, Clone, Default)]
struct GroupKeys {
    down: Option<String>,
    up: Option<String>,
    alpha: Option<String>,
    direct_target: Option<String>,
}

/// Merges adapter deltas into a [`WeightDict`] holding base model weights
#[derive(Debug, Clone)]
pub struct WeightMerger {
    source_prefix: String,
    target_prefix: String,
    separator: String,
}

impl Default for WeightMerger {
    fn default() -> Self {
        Self::new("lora_unet", "diffusion_model", "_")
    }
}

impl WeightMerger {
    /// Create a merger for the given key prefixes
    pub fn new(
        source_prefix: impl Into<String>,
        target_prefix: impl Into<String>,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            source_prefix: source_prefix.into(),
            target_prefix: target_prefix.into(),
            separator: separator.into(),
        }
    }

    /// Use the prefixes and separator of the conversion settings
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(
            config.source_prefix.clone(),
            config.target_prefix.clone(),
            config.separator.clone(),
        )
    }

    /// Flattened group name for each base weight
    fn flattened_index(&self, base: &WeightDict) -> HashMap<String, String> {
        let mut index = HashMap::new();
        for key in base.keys() {
            let Some(module) = key.strip_suffix(WEIGHT_SUFFIX) else {
                continue;
            };
            let module = module
                .strip_prefix(&format!("{}.", self.target_prefix))
                .unwrap_or(module);
            let flattened = format!(
                "{}{}{}",
                self.source_prefix,
                self.separator,
                module.replace('.', &self.separator)
            );
            index.insert(flattened, key.clone());
        }
        index
    }

    fn group_keys(lora: &WeightDict) -> BTreeMap<String, GroupKeys> {
        let mut groups: BTreeMap<String, GroupKeys> = BTreeMap::new();

        for key in lora.keys() {
            if let Some(module) = key.strip_suffix(LORA_A_SUFFIX) {
                let keys = groups.entry(module.to_string()).or_default();
                keys.down = Some(key.clone());
                keys.direct_target = Some(format!("{module}{WEIGHT_SUFFIX}"));
            } else if let Some(module) = key.strip_suffix(LORA_B_SUFFIX) {
                let keys = groups.entry(module.to_string()).or_default();
                keys.up = Some(key.clone());
                keys.direct_target = Some(format!("{module}{WEIGHT_SUFFIX}"));
            } else if let Some((group, suffix)) = key.split_once('.') {
                let is_factor = suffix.starts_with(LORA_DOWN) || suffix.starts_with(LORA_UP);
                if !is_factor && suffix != ALPHA {
                    debug!("Ignoring adapter key {}", key);
                    continue;
                }
                let keys = groups.entry(group.to_string()).or_default();
                if suffix.starts_with(LORA_DOWN) {
                    keys.down = Some(key.clone());
                } else if suffix.starts_with(LORA_UP) {
                    keys.up = Some(key.clone());
                } else {
                    keys.alpha = Some(key.clone());
                }
            }
        }
        groups
    }

    /// Match adapter groups to base weights
    pub fn plan(&self, base: &WeightDict, lora: &WeightDict) -> Result<MergePlan> {
        let index = self.flattened_index(base);
        let mut plan = MergePlan::default();

        for (group, keys) in Self::group_keys(lora) {
            let (Some(down), Some(_)) = (&keys.down, &keys.up) else {
                warn!("Adapter group {} is missing a factor", group);
                plan.unresolved.push(group);
                continue;
            };

            let base_key = match &keys.direct_target {
                Some(target) if base.contains_key(target) => Some(target.clone()),
                Some(target) => target
                    .strip_prefix(&format!("{}.", self.target_prefix))
                    .filter(|stripped| base.contains_key(stripped))
                    .map(str::to_string),
                None => index.get(&group).cloned(),
            };
            let Some(base_key) = base_key else {
                plan.unresolved.push(group);
                continue;
            };

            let scale = match &keys.alpha {
                Some(alpha_key) => {
                    let alpha = lora
                        .get(alpha_key)
                        .ok_or_else(|| Error::missing_tensor(alpha_key))?;
                    let down = lora.get(down).ok_or_else(|| Error::missing_tensor(down))?;
                    scalar_value(alpha)? / down.dim(0)? as f64
                }
                None => 1.0,
            };

            plan.targets.push(MergeTarget {
                group,
                base_key,
                scale,
            });
        }

        Ok(plan)
    }

    fn delta(
        &self,
        lora: &WeightDict,
        group: &str,
        keys: &GroupKeys,
        base: &Tensor,
    ) -> Result<Tensor> {
        let factor = |key: &Option<String>| -> Result<Tensor> {
            let key = key.as_deref().ok_or_else(|| Error::missing_tensor(group))?;
            let tensor = lora.get(key).ok_or_else(|| Error::missing_tensor(key))?;
            Ok(tensor.to_dtype(DType::F32)?.flatten_from(1)?)
        };

        let delta = factor(&keys.up)?.matmul(&factor(&keys.down)?)?;
        if delta.elem_count() != base.elem_count() {
            return Err(Error::invalid_input(format!(
                "Delta for {} has shape {:?}, base weight has {:?}",
                group,
                delta.dims(),
                base.dims()
            )));
        }
        Ok(delta.reshape(base.dims())?)
    }

    /// Merge `lora` into a copy of `base`, returning it with the plan used
    #[instrument(skip_all, fields(base = base.len(), lora = lora.len(), strength = strength))]
    pub fn merge(
        &self,
        base: &WeightDict,
        lora: &WeightDict,
        strength: f64,
    ) -> Result<(WeightDict, MergePlan)> {
        let plan = self.plan(base, lora)?;
        let groups = Self::group_keys(lora);
        let mut merged = base.clone();

        for target in &plan.targets {
            let Some(keys) = groups.get(&target.group) else {
                continue;
            };
            let weight = base
                .get(&target.base_key)
                .ok_or_else(|| Error::missing_tensor(&target.base_key))?;

            let delta = self.delta(lora, &target.group, keys, weight)?;
            let patched = weight
                .to_dtype(DType::F32)?
                .add(&delta.affine(strength * target.scale, 0.0)?)?
                .to_dtype(weight.dtype())?;
            merged.insert(target.base_key.clone(), patched);
            debug!("Patched {} from {}", target.base_key, target.group);
        }

        info!(
            "Merge complete: {} groups patched, {} unresolved",
            plan.targets.len(),
            plan.unresolved.len()
        );
        if !plan.unresolved.is_empty() {
            warn!("Unresolved adapter groups: {}", plan.unresolved.join(", "));
        }

        Ok((merged, plan))
    }
}

/// Base weights together with every patch applied so far
#[derive(Debug, Clone, Default)]
pub struct PatchedModel {
    /// Current weights
    pub weights: WeightDict,
    /// Accumulated plans of all applied adapters
    pub applied: MergePlan,
}

impl From<WeightDict> for PatchedModel {
    fn from(weights: WeightDict) -> Self {
        Self {
            weights,
            applied: MergePlan::default(),
        }
    }
}

impl LoraPatcher for WeightMerger {
    type Model = PatchedModel;

    fn apply_lora(
        &self,
        model: &PatchedModel,
        lora: &WeightDict,
        strength: f64,
    ) -> Result<PatchedModel> {
        let (weights, plan) = self.merge(&model.weights, lora, strength)?;

        let mut applied = model.applied.clone();
        applied.targets.extend(plan.targets);
        applied.unresolved.extend(plan.unresolved);
        Ok(PatchedModel { weights, applied })
    }
}
