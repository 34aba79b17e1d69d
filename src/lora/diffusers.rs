//! Diffusers-style converter
//!
//! Re-keys `{prefix}_{flattened_module}.lora_down/lora_up` tensors into
//! `{target}.{module.path}.lora_A/lora_B.weight`. Alpha is folded into the
//! factors themselves: each factor is multiplied by `sqrt(alpha / rank)` so
//! that their product carries the full `alpha / rank` scale and the host can
//! apply the pair unscaled.

use candle_core::Tensor;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

use super::fusion::{fuse_qkv, LoraPair};
use super::tables::{ArchitectureFamily, ReverseModuleMap, MODULE_TEMPLATES};
use super::{ConversionReport, Converted, LoraConverter, ALPHA, LORA_DOWN, LORA_UP};
use crate::config::{ConversionConfig, ConversionStrategy};
use crate::error::{Error, Result};
use crate::weights::{group_name, scalar_value, WeightDict};

const QUERY_MODULE: &str = "to_q";
const KEY_MODULE: &str = "to_k";
const VALUE_MODULE: &str = "to_v";
const FUSED_MODULE: &str = "qkv";

/// Which factor of a pair a key holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorRole {
    /// Down projection, becomes `lora_A`
    Down,
    /// Up projection, becomes `lora_B`
    Up,
}

impl FactorRole {
    /// Classify the part of a key after its group name
    pub fn classify(suffix: &str) -> Option<Self> {
        if suffix.starts_with(LORA_DOWN) {
            Some(FactorRole::Down)
        } else if suffix.starts_with(LORA_UP) {
            Some(FactorRole::Up)
        } else {
            None
        }
    }

    /// Key suffix in the host convention
    pub fn host_suffix(self) -> &'static str {
        match self {
            FactorRole::Down => "lora_A.weight",
            FactorRole::Up => "lora_B.weight",
        }
    }

    /// Axis holding the rank for this factor
    pub fn rank_axis(self) -> usize {
        match self {
            FactorRole::Down => 0,
            FactorRole::Up => 1,
        }
    }
}

/// Converts prefixed, flattened LoRA keys to `lora_A`/`lora_B` module keys
#[derive(Debug, Clone)]
pub struct DiffusersConverter {
    templates: Vec<&'static str>,
    source_prefix: String,
    target_prefix: String,
    separator: String,
    max_block_index: usize,
    fuse_qkv: bool,
}

impl Default for DiffusersConverter {
    fn default() -> Self {
        Self::from_config(&ConversionConfig::default())
    }
}

impl DiffusersConverter {
    /// Create a converter using the built-in module templates
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(MODULE_TEMPLATES.to_vec(), config)
    }

    /// Create a converter with explicit module templates
    pub fn new(templates: Vec<&'static str>, config: &ConversionConfig) -> Self {
        Self {
            templates,
            source_prefix: config.source_prefix.clone(),
            target_prefix: config.target_prefix.clone(),
            separator: config.separator.clone(),
            max_block_index: config.max_block_index,
            fuse_qkv: config.fuse_qkv,
        }
    }

    /// Enable or disable QKV fusion
    pub fn with_fuse_qkv(mut self, fuse_qkv: bool) -> Self {
        self.fuse_qkv = fuse_qkv;
        self
    }

    /// Build the reverse module map for one conversion
    pub fn module_map(&self) -> ReverseModuleMap {
        ReverseModuleMap::build(
            &self.templates,
            &self.source_prefix,
            &self.separator,
            self.max_block_index,
        )
    }

    /// Resolve a group name to a dotted module path
    pub fn module_path(&self, map: &ReverseModuleMap, group: &str) -> String {
        if let Some(path) = map.get(group) {
            return path.to_string();
        }

        let stripped = group
            .strip_prefix(self.source_prefix.as_str())
            .map(|rest| rest.strip_prefix(self.separator.as_str()).unwrap_or(rest))
            .unwrap_or(group);
        let family = ArchitectureFamily::detect(stripped);
        let path = family.clean(&stripped.replace(self.separator.as_str(), "."));
        debug!("Derived module path {} for {} ({:?})", path, group, family);
        path
    }

    fn host_key(&self, module: &str, role: FactorRole) -> String {
        format!("{}.{}.{}", self.target_prefix, module, role.host_suffix())
    }

    /// Groups whose q/k/v siblings are fused, keyed by the query group
    fn plan_fusion(&self, weights: &WeightDict, map: &ReverseModuleMap) -> Vec<QkvGroup> {
        if !self.fuse_qkv {
            return Vec::new();
        }

        let mut groups = Vec::new();
        for key in weights.keys() {
            let group = group_name(&key);
            if key[group.len()..] != format!(".{LORA_UP}.weight") {
                continue;
            }
            let Some(base) = group.strip_suffix(QUERY_MODULE) else {
                continue;
            };
            let module = self.module_path(map, group);
            let Some(module_base) = module.strip_suffix(QUERY_MODULE) else {
                continue;
            };
            groups.push(QkvGroup {
                members: [
                    group.to_string(),
                    format!("{base}{KEY_MODULE}"),
                    format!("{base}{VALUE_MODULE}"),
                ],
                module: format!("{module_base}{FUSED_MODULE}"),
            });
        }
        groups
    }

    fn fuse_group(
        &self,
        weights: &WeightDict,
        alphas: &HashMap<String, Tensor>,
        group: &QkvGroup,
        output: &mut WeightDict,
        report: &mut ConversionReport,
    ) -> Result<()> {
        let [q, k, v] = &group.members;
        let fused = fuse_qkv(
            required_pair(weights, q)?,
            required_pair(weights, k)?,
            required_pair(weights, v)?,
            alphas.get(q.as_str()),
        )?;

        let alpha = fused.alpha.as_ref().map(scalar_value).transpose()?;
        for (role, tensor) in [(FactorRole::Down, fused.down), (FactorRole::Up, fused.up)] {
            let tensor = scale_factor(tensor, role, alpha, q, report)?;
            output.insert(self.host_key(&group.module, role), tensor);
            report.emitted += 1;
        }

        debug!("Fused {} into {}", q, group.module);
        report.fused += 1;
        Ok(())
    }
}

/// Members of one fused attention group
#[derive(Debug, Clone)]
struct QkvGroup {
    members: [String; 3],
    module: String,
}

fn required_pair(weights: &WeightDict, group: &str) -> Result<LoraPair> {
    let get = |suffix: &str| {
        let key = format!("{group}.{suffix}.weight");
        weights.get(&key).cloned().ok_or_else(|| Error::missing_tensor(key))
    };
    Ok(LoraPair::new(get(LORA_DOWN)?, get(LORA_UP)?))
}

/// Multiply a factor by `sqrt(alpha / rank)`, or leave it as-is without an alpha
fn scale_factor(
    tensor: Tensor,
    role: FactorRole,
    alpha: Option<f64>,
    group: &str,
    report: &mut ConversionReport,
) -> Result<Tensor> {
    let Some(alpha) = alpha else {
        if !report.unscaled_groups.iter().any(|g| g == group) {
            warn!("No alpha found for {}, leaving weights unscaled", group);
            report.unscaled_groups.push(group.to_string());
        }
        return Ok(tensor);
    };

    let rank = tensor.dim(role.rank_axis())?;
    let scale = (alpha / rank as f64).sqrt();
    report.scaled += 1;
    Ok(tensor.affine(scale, 0.0)?)
}

impl LoraConverter for DiffusersConverter {
    fn strategy(&self) -> ConversionStrategy {
        ConversionStrategy::Diffusers
    }

    #[instrument(skip_all, fields(tensors = weights.len()))]
    fn convert(&self, weights: &WeightDict) -> Result<Converted> {
        info!("Converting LoRA to {} lora_A/lora_B keys", self.target_prefix);

        let map = self.module_map();
        let mut report = ConversionReport::new(self.strategy());
        let mut output = WeightDict::new();

        let alphas: HashMap<String, Tensor> = weights
            .iter()
            .filter(|(key, _)| key.ends_with(&format!(".{ALPHA}")))
            .map(|(key, tensor)| (group_name(key).to_string(), tensor.clone()))
            .collect();

        let fusion = self.plan_fusion(weights, &map);
        let fused_members: HashSet<&str> = fusion
            .iter()
            .flat_map(|group| group.members.iter().map(String::as_str))
            .collect();

        for (key, tensor) in weights.iter() {
            let group = group_name(key);
            let suffix = key[group.len()..].trim_start_matches('.');
            if suffix == ALPHA {
                continue;
            }
            if fused_members.contains(group) {
                if FactorRole::classify(suffix).is_none() {
                    warn!("Unrecognized key in fused group, skipping: {}", key);
                    report.skipped_keys.push(key.clone());
                }
                continue;
            }
            if !key.starts_with(self.source_prefix.as_str()) {
                debug!("Skipping {} without prefix {}", key, self.source_prefix);
                report.skipped_keys.push(key.clone());
                continue;
            }

            let Some(role) = FactorRole::classify(suffix) else {
                warn!("Unrecognized LoRA key suffix, skipping: {}", key);
                report.skipped_keys.push(key.clone());
                continue;
            };

            let alpha = alphas.get(group).map(scalar_value).transpose()?;
            let tensor = scale_factor(tensor.clone(), role, alpha, group, &mut report)?;
            let module = self.module_path(&map, group);
            output.insert(self.host_key(&module, role), tensor);
            report.emitted += 1;
        }

        for group in &fusion {
            self.fuse_group(weights, &alphas, group, &mut output, &mut report)?;
        }

        info!(
            "Converted {} tensors ({} scaled, {} QKV groups fused)",
            output.len(),
            report.scaled,
            report.fused
        );
        if !report.unscaled_groups.is_empty() {
            warn!("{} groups had no alpha and were left unscaled", report.unscaled_groups.len());
        }

        Ok(Converted {
            weights: output,
            report,
        })
    }
}
