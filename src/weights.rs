//! Weight dictionary shared by the loaders, converters and patchers

use candle_core::{DType, Tensor};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// Ordered mapping from parameter key to tensor
///
/// Keys are kept sorted so conversions are deterministic regardless of the
/// order the container stored them in.
#[derive(Debug, Clone, Default)]
pub struct WeightDict {
    tensors: BTreeMap<String, Tensor>,
}

impl WeightDict {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the dictionary holds no tensors
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Get a tensor by key
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Insert a tensor, returning the one it replaced
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    /// Remove a tensor if present
    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.tensors.remove(key)
    }

    /// Remove a tensor that must be present
    pub fn take(&mut self, key: &str) -> Result<Tensor> {
        self.tensors
            .remove(key)
            .ok_or_else(|| Error::missing_tensor(key))
    }

    /// Immutable snapshot of the current keys, safe to iterate while mutating
    pub fn keys(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    /// Total number of elements across all tensors
    pub fn total_elements(&self) -> usize {
        self.tensors.values().map(|t| t.elem_count()).sum()
    }

    /// Convert into a plain map, e.g. for `candle_core::safetensors::save`
    pub fn into_hash_map(self) -> HashMap<String, Tensor> {
        self.tensors.into_iter().collect()
    }
}

impl From<HashMap<String, Tensor>> for WeightDict {
    fn from(map: HashMap<String, Tensor>) -> Self {
        map.into_iter().collect()
    }
}

impl FromIterator<(String, Tensor)> for WeightDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WeightDict {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

/// Part of a key before the first `.`, the LoRA group name
pub fn group_name(key: &str) -> &str {
    key.split_once('.').map_or(key, |(group, _)| group)
}

/// Read a scalar from a 0-d or single-element tensor
pub fn scalar_value(tensor: &Tensor) -> Result<f64> {
    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    match values.as_slice() {
        [value] => Ok(*value),
        _ => Err(Error::invalid_input(format!(
            "Expected a scalar tensor, got shape {:?}",
            tensor.dims()
        ))),
    }
}
