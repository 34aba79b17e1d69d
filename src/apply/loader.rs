//! Reading adapters and base weights from safetensors files

use candle_core::{DType, Device, Tensor};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::AdapterSource;
use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::weights::WeightDict;

const SAFETENSORS_EXTENSION: &str = "safetensors";

/// Adapters stored as `*.safetensors` files in one directory
#[derive(Debug, Clone)]
pub struct SafetensorsDirectory {
    root: PathBuf,
    device: Device,
}

impl SafetensorsDirectory {
    /// Serve adapters from `root`, placing tensors on `device`
    pub fn new(root: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            root: root.into(),
            device,
        }
    }

    /// Build from loader settings
    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        Ok(Self::new(config.lora_dir.clone(), config.device.to_device()?))
    }

    /// Directory adapters are read from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file behind `name`
    ///
    /// A name without extension also matches `<name>.safetensors`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        if path.is_file() {
            return Ok(path);
        }

        if path.extension().is_none() {
            let with_extension = path.with_extension(SAFETENSORS_EXTENSION);
            if with_extension.is_file() {
                return Ok(with_extension);
            }
        }

        Err(Error::AdapterNotFound(path))
    }
}

impl AdapterSource for SafetensorsDirectory {
    fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(Error::AdapterNotFound(self.root.clone()));
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_adapter = path.is_file()
                && path.extension().and_then(|ext| ext.to_str()) == Some(SAFETENSORS_EXTENSION);
            if let (true, Some(name)) = (is_adapter, path.file_name().and_then(|n| n.to_str())) {
                names.push(name.to_string());
            }
        }
        names.sort();

        debug!("Found {} adapters in {}", names.len(), self.root.display());
        Ok(names)
    }

    fn load(&self, name: &str) -> Result<WeightDict> {
        let path = self.resolve(name)?;
        load_safetensors(&path, &self.device)
    }
}

/// Read every tensor of a safetensors file onto `device`
pub fn load_safetensors(path: &Path, device: &Device) -> Result<WeightDict> {
    let data = std::fs::read(path)?;
    let tensors = safetensors::SafeTensors::deserialize(&data)?;

    let mut weights = WeightDict::new();
    for (name, view) in tensors.tensors() {
        let dtype = match view.dtype() {
            safetensors::Dtype::F64 => DType::F64,
            safetensors::Dtype::F32 => DType::F32,
            safetensors::Dtype::F16 => DType::F16,
            safetensors::Dtype::BF16 => DType::BF16,
            safetensors::Dtype::U8 => DType::U8,
            safetensors::Dtype::U32 => DType::U32,
            safetensors::Dtype::I64 => DType::I64,
            other => {
                return Err(Error::invalid_input(format!(
                    "Unsupported tensor dtype {:?} for {} in {}",
                    other,
                    name,
                    path.display()
                )))
            }
        };

        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
        weights.insert(name, tensor);
    }

    info!("Loaded {} tensors from {}", weights.len(), path.display());
    Ok(weights)
}
