//! Test fixtures shared by the integration tests

use candle_core::{DType, Device, Tensor};
use lora_rekey::WeightDict;
use std::path::Path;
use tempfile::TempDir;

/// Factors of one synthetic adapter group
pub struct GroupSpec<'a> {
    pub group: &'a str,
    pub rank: usize,
    pub in_features: usize,
    pub out_features: usize,
    pub alpha: Option<f32>,
}

impl<'a> GroupSpec<'a> {
    pub fn new(group: &'a str, rank: usize, in_features: usize, out_features: usize) -> Self {
        Self {
            group,
            rank,
            in_features,
            out_features,
            alpha: Some(rank as f32 / 2.0),
        }
    }

    pub fn alpha(mut self, alpha: Option<f32>) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn insert_into(&self, dict: &mut WeightDict) {
        let device = Device::Cpu;
        dict.insert(
            format!("{}.lora_down.weight", self.group),
            Tensor::randn(0f32, 1f32, (self.rank, self.in_features), &device).unwrap(),
        );
        dict.insert(
            format!("{}.lora_up.weight", self.group),
            Tensor::randn(0f32, 1f32, (self.out_features, self.rank), &device).unwrap(),
        );
        if let Some(alpha) = self.alpha {
            dict.insert(format!("{}.alpha", self.group), Tensor::new(alpha, &device).unwrap());
        }
    }
}

/// Z-Image attention block with separate q/k/v adapters and an output adapter
pub fn z_image_adapter(block: usize, rank: usize, width: usize) -> WeightDict {
    let mut dict = WeightDict::new();
    for member in ["to_q", "to_k", "to_v", "to_out_0"] {
        let group = format!("lora_unet_layers_{block}_attention_{member}");
        GroupSpec::new(&group, rank, width, width)
            .alpha(Some(4.0))
            .insert_into(&mut dict);
    }
    dict
}

/// Base weights matching [`z_image_adapter`] after conversion
pub fn z_image_base(block: usize, width: usize) -> WeightDict {
    let device = Device::Cpu;
    let mut base = WeightDict::new();
    base.insert(
        format!("diffusion_model.layers.{block}.attention.qkv.weight"),
        Tensor::zeros((3 * width, width), DType::F32, &device).unwrap(),
    );
    base.insert(
        format!("diffusion_model.layers.{block}.attention.out.weight"),
        Tensor::zeros((width, width), DType::F32, &device).unwrap(),
    );
    base
}

/// Write `dict` as `<dir>/<file>`
pub fn write_adapter(dir: &Path, file: &str, dict: &WeightDict) {
    candle_core::safetensors::save(&dict.clone().into_hash_map(), dir.join(file)).unwrap();
}

/// Temporary adapter directory holding one file
pub fn adapter_dir(file: &str, dict: &WeightDict) -> TempDir {
    let dir = TempDir::new().unwrap();
    write_adapter(dir.path(), file, dict);
    dir
}

pub fn flat(tensor: &Tensor) -> Vec<f32> {
    tensor
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

pub fn assert_close(actual: &Tensor, expected: &Tensor) {
    assert_eq!(actual.dims(), expected.dims());
    for (a, b) in flat(actual).iter().zip(flat(expected).iter()) {
        approx::assert_relative_eq!(a, b, epsilon = 1e-4, max_relative = 1e-4);
    }
}
