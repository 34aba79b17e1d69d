//! Architecture mapping tables
//!
//! All tables are plain data. Converters receive them by value or reference so
//! tests can substitute their own.

use std::collections::HashMap;

/// Placeholder expanded to block indices in module templates
pub const BLOCK_PLACEHOLDER: &str = "{}";

/// Substring renames for one architecture, selected by an identifying substring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartition {
    /// Substring a key must contain for this partition to apply
    pub marker: &'static str,
    /// Ordered (source, target) substring replacements
    pub renames: &'static [(&'static str, &'static str)],
}

/// Z-Image blocks
const LAYERS_RENAMES: &[(&str, &str)] = &[
    ("attention_to_out_0", "attention_out"),
    ("attention_norm_k", "attention_k_norm"),
    ("attention_norm_q", "attention_q_norm"),
];

/// HunyuanVideo 1.5 double blocks
const DOUBLE_BLOCKS_RENAMES: &[(&str, &str)] = &[
    ("img_mlp_fc1", "img_mlp_0"),
    ("img_mlp_fc2", "img_mlp_2"),
    ("img_mod_linear", "img_mod_lin"),
    ("txt_mlp_fc1", "txt_mlp_0"),
    ("txt_mlp_fc2", "txt_mlp_2"),
    ("txt_mod_linear", "txt_mod_lin"),
];

/// Key pattern table used by the direct-rename converter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPatternTable {
    partitions: Vec<KeyPartition>,
}

impl Default for KeyPatternTable {
    fn default() -> Self {
        Self::new(vec![
            KeyPartition {
                marker: "layers",
                renames: LAYERS_RENAMES,
            },
            KeyPartition {
                marker: "double_blocks",
                renames: DOUBLE_BLOCKS_RENAMES,
            },
        ])
    }
}

impl KeyPatternTable {
    /// Build a table from partitions, checked in the given order
    pub fn new(partitions: Vec<KeyPartition>) -> Self {
        Self { partitions }
    }

    /// Apply the first matching partition to `key`
    ///
    /// Returns `None` when no partition marker is present.
    pub fn rename(&self, key: &str) -> Option<String> {
        let partition = self.partitions.iter().find(|p| key.contains(p.marker))?;
        let renamed = partition
            .renames
            .iter()
            .fold(key.to_string(), |acc, (from, to)| acc.replace(from, to));
        Some(renamed)
    }
}

/// Markers and member labels of one fused attention layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QkvVariant {
    /// Display name used in logs
    pub name: &'static str,
    /// A key must contain one of these...
    pub block_markers: &'static [&'static str],
    /// ...and one of the member labels to belong to this variant
    pub members: [&'static str; 3],
    /// Label replacing the members in the fused group name
    pub fused: &'static str,
}

impl QkvVariant {
    /// Whether the key belongs to this variant
    pub fn claims(&self, key: &str) -> bool {
        self.block_markers.iter().any(|m| key.contains(m))
            && self.members.iter().any(|m| key.contains(m))
    }

    /// Label of the query projection
    pub fn query(&self) -> &'static str {
        self.members[0]
    }
}

/// QKV layouts recognised by the direct-rename converter, in priority order
pub const QKV_VARIANTS: &[QkvVariant] = &[
    QkvVariant {
        name: "z-image",
        block_markers: &["attention"],
        members: ["to_q", "to_k", "to_v"],
        fused: "qkv",
    },
    QkvVariant {
        name: "hunyuan-video",
        block_markers: &["img_attn", "txt_attn"],
        members: ["_q", "_k", "_v"],
        fused: "_qkv",
    },
];

/// Canonical module templates for the diffusers-style converter
pub const MODULE_TEMPLATES: &[&str] = &[
    // Z-Image
    "layers.{}.attention.to_q",
    "layers.{}.attention.to_k",
    "layers.{}.attention.to_v",
    "layers.{}.attention.to_out.0",
    "layers.{}.feed_forward.w1",
    "layers.{}.feed_forward.w2",
    "layers.{}.feed_forward.w3",
    "layers.{}.adaLN_modulation.0",
    "noise_refiner.{}.attention.to_q",
    "noise_refiner.{}.attention.to_k",
    "noise_refiner.{}.attention.to_v",
    "noise_refiner.{}.attention.to_out.0",
    "noise_refiner.{}.feed_forward.w1",
    "noise_refiner.{}.feed_forward.w2",
    "noise_refiner.{}.feed_forward.w3",
    "noise_refiner.{}.adaLN_modulation.0",
    "context_refiner.{}.attention.to_q",
    "context_refiner.{}.attention.to_k",
    "context_refiner.{}.attention.to_v",
    "context_refiner.{}.attention.to_out.0",
    "context_refiner.{}.feed_forward.w1",
    "context_refiner.{}.feed_forward.w2",
    "context_refiner.{}.feed_forward.w3",
    // Wan
    "blocks.{}.self_attn.q",
    "blocks.{}.self_attn.k",
    "blocks.{}.self_attn.v",
    "blocks.{}.self_attn.o",
    "blocks.{}.cross_attn.q",
    "blocks.{}.cross_attn.k",
    "blocks.{}.cross_attn.v",
    "blocks.{}.cross_attn.o",
    "blocks.{}.ffn.0",
    "blocks.{}.ffn.2",
    // Dual-stream (HunyuanVideo, Flux)
    "double_blocks.{}.img_attn.qkv",
    "double_blocks.{}.img_attn.proj",
    "double_blocks.{}.img_mlp.0",
    "double_blocks.{}.img_mlp.2",
    "double_blocks.{}.img_mod.lin",
    "double_blocks.{}.txt_attn.qkv",
    "double_blocks.{}.txt_attn.proj",
    "double_blocks.{}.txt_mlp.0",
    "double_blocks.{}.txt_mlp.2",
    "double_blocks.{}.txt_mod.lin",
    "single_blocks.{}.linear1",
    "single_blocks.{}.linear2",
    "single_blocks.{}.modulation.lin",
    // Unindexed
    "t_embedder.mlp.0",
    "t_embedder.mlp.2",
    "cap_embedder.1",
    "x_embedder",
    "final_layer.linear",
    "final_layer.adaLN_modulation.1",
];

/// Lookup from flattened LoRA group names to dotted module paths
#[derive(Debug, Clone, Default)]
pub struct ReverseModuleMap {
    entries: HashMap<String, String>,
}

impl ReverseModuleMap {
    /// Expand `templates` for block indices `0..max_block_index`
    pub fn build(
        templates: &[&str],
        prefix: &str,
        separator: &str,
        max_block_index: usize,
    ) -> Self {
        let mut entries = HashMap::new();

        for template in templates {
            if template.contains(BLOCK_PLACEHOLDER) {
                for index in 0..max_block_index {
                    let path = template.replace(BLOCK_PLACEHOLDER, &index.to_string());
                    entries.insert(flatten(prefix, separator, &path), path);
                }
            } else {
                entries.insert(flatten(prefix, separator, template), template.to_string());
            }
        }

        Self { entries }
    }

    /// Exact-match lookup
    pub fn get(&self, group: &str) -> Option<&str> {
        self.entries.get(group).map(String::as_str)
    }

    /// Number of registered names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no names are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn flatten(prefix: &str, separator: &str, path: &str) -> String {
    format!("{prefix}{separator}{}", path.replace('.', separator))
}

/// Naming family, detected from a telltale substring of the source name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureFamily {
    /// `self_attn` / `cross_attn` blocks (Wan)
    CrossSelfAttention,
    /// `attention.to_q`, `feed_forward` and refiner blocks (Z-Image)
    DottedAttention,
    /// `double_blocks` / `single_blocks` (HunyuanVideo, Flux)
    DualStream,
    /// Names already match after dot substitution
    Default,
}

const CROSS_SELF_ATTENTION_RULES: &[(&str, &str)] = &[
    ("self.attn", "self_attn"),
    ("cross.attn", "cross_attn"),
    ("norm.q", "norm_q"),
    ("norm.k", "norm_k"),
];

const DOTTED_ATTENTION_RULES: &[(&str, &str)] = &[
    ("noise.refiner", "noise_refiner"),
    ("context.refiner", "context_refiner"),
    ("to.q", "to_q"),
    ("to.k", "to_k"),
    ("to.v", "to_v"),
    ("to.out", "to_out"),
    ("norm.q", "norm_q"),
    ("norm.k", "norm_k"),
    ("feed.forward", "feed_forward"),
    ("adaLN.modulation", "adaLN_modulation"),
];

const DOTTED_ATTENTION_MARKERS: &[&str] = &[
    "attention",
    "feed_forward",
    "adaLN_modulation",
    "noise_refiner",
    "context_refiner",
];

const DUAL_STREAM_RULES: &[(&str, &str)] = &[
    ("double.blocks", "double_blocks"),
    ("single.blocks", "single_blocks"),
    ("img.attn", "img_attn"),
    ("txt.attn", "txt_attn"),
    ("img.mlp", "img_mlp"),
    ("txt.mlp", "txt_mlp"),
    ("img.mod", "img_mod"),
    ("txt.mod", "txt_mod"),
];

impl ArchitectureFamily {
    /// Detect the family from a source name with the prefix stripped
    pub fn detect(name: &str) -> Self {
        if name.contains("cross_attn") || name.contains("self_attn") {
            ArchitectureFamily::CrossSelfAttention
        } else if DOTTED_ATTENTION_MARKERS.iter().any(|m| name.contains(m)) {
            ArchitectureFamily::DottedAttention
        } else if name.contains("double_blocks") || name.contains("single_blocks") {
            ArchitectureFamily::DualStream
        } else {
            ArchitectureFamily::Default
        }
    }

    /// Ordered cleanup rules restoring underscores lost to dot substitution
    pub fn cleanup_rules(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ArchitectureFamily::CrossSelfAttention => CROSS_SELF_ATTENTION_RULES,
            ArchitectureFamily::DottedAttention => DOTTED_ATTENTION_RULES,
            ArchitectureFamily::DualStream => DUAL_STREAM_RULES,
            ArchitectureFamily::Default => &[],
        }
    }

    /// Apply the cleanup rules to a dotted path
    pub fn clean(self, dotted: &str) -> String {
        self.cleanup_rules()
            .iter()
            .fold(dotted.to_string(), |acc, (from, to)| acc.replace(from, to))
    }
}
