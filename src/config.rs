//! Configuration structures for LoRA conversion

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Largest strength magnitude accepted by the loader
pub const MAX_STRENGTH: f64 = 100.0;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Key conversion settings
    pub conversion: ConversionConfig,
    /// Adapter loading settings
    pub loader: LoaderConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON, YAML or TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration, choosing the format from the file extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.conversion.validate()?;

        let strength = self.loader.default_strength;
        if !strength.is_finite() || strength.abs() > MAX_STRENGTH {
            return Err(Error::config(format!(
                "Default strength must be within [-{MAX_STRENGTH}, {MAX_STRENGTH}], got {strength}"
            )));
        }

        Ok(())
    }
}

/// Which converter handles the adapter
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStrategy {
    /// Substring renames plus QKV fusion, keys stay in the `lora_unet_*` form
    #[default]
    Direct,
    /// Module-path derivation into `lora_A`/`lora_B` keys with alpha folded in
    Diffusers,
}

impl std::fmt::Display for ConversionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionStrategy::Direct => write!(f, "direct"),
            ConversionStrategy::Diffusers => write!(f, "diffusers"),
        }
    }
}

/// Key conversion settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConversionConfig {
    /// Converter to run
    pub strategy: ConversionStrategy,
    /// Prefix of source keys (diffusers-style converter)
    pub source_prefix: String,
    /// Prefix of emitted keys (diffusers-style converter)
    pub target_prefix: String,
    /// Separator used to flatten module paths in source keys
    pub separator: String,
    /// Exclusive upper bound for expanded block indices
    pub max_block_index: usize,
    /// Fuse `to_q`/`to_k`/`to_v` groups into `qkv` in the diffusers-style converter
    pub fuse_qkv: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            strategy: ConversionStrategy::Direct,
            source_prefix: "lora_unet".to_string(),
            target_prefix: "diffusion_model".to_string(),
            separator: "_".to_string(),
            max_block_index: 100,
            fuse_qkv: false,
        }
    }
}

impl ConversionConfig {
    /// Validate conversion settings
    pub fn validate(&self) -> Result<()> {
        if self.source_prefix.is_empty() {
            return Err(Error::config("Source prefix must not be empty"));
        }
        if self.target_prefix.is_empty() {
            return Err(Error::config("Target prefix must not be empty"));
        }
        if self.separator.is_empty() {
            return Err(Error::config("Separator must not be empty"));
        }
        if self.separator == "." {
            return Err(Error::config("Separator must differ from the module path delimiter '.'"));
        }
        if self.max_block_index == 0 {
            return Err(Error::config("Max block index must be > 0"));
        }
        Ok(())
    }
}

/// Adapter loading settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directory holding adapter files
    pub lora_dir: PathBuf,
    /// Device tensors are placed on
    pub device: DeviceType,
    /// Strength used when none is given on the command line
    pub default_strength: f64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            lora_dir: PathBuf::from("models/loras"),
            device: DeviceType::Cpu,
            default_strength: 1.0,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of terminal output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Device types
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CPU device
    #[default]
    Cpu,
    /// CUDA GPU
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}

impl DeviceType {
    /// Open the candle device for this type
    pub fn to_device(self) -> Result<Device> {
        match self {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Cuda => Ok(Device::new_cuda(0)?),
            DeviceType::Metal => Ok(Device::new_metal(0)?),
        }
    }
}
