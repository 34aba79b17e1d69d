//! Fusion of separate query/key/value LoRA factors into one `qkv` pair
//!
//! The host applies a single fused projection, so three rank-`r` adapters are
//! rewritten as one rank-`3r` adapter whose up factor is block diagonal:
//!
//! ```text
//! fused_down = [down_q; down_k; down_v]            (3r, in)
//! fused_up   = | up_q   0     0   |                (3 * split, 3r)
//!              | 0      up_k  0   |
//!              | 0      0     up_v|
//! ```
//!
//! The off-diagonal zeros mean `fused_up @ fused_down` is exactly the row
//! concatenation of the three individual products.

use candle_core::Tensor;
use tracing::debug;

use crate::error::Result;

/// Multiplier applied to alpha because the fused rank is three times larger
pub const QKV_ALPHA_FACTOR: f64 = 3.0;

/// One low-rank factor pair
#[derive(Debug, Clone)]
pub struct LoraPair {
    /// Down projection, (rank, in_features)
    pub down: Tensor,
    /// Up projection, (out_features, rank)
    pub up: Tensor,
}

impl LoraPair {
    /// Create a pair from its factors
    pub fn new(down: Tensor, up: Tensor) -> Self {
        Self { down, up }
    }

    /// Rank taken from the up factor's second axis
    pub fn rank(&self) -> Result<usize> {
        Ok(self.up.dim(1)?)
    }
}

/// Result of fusing three pairs
#[derive(Debug, Clone)]
pub struct FusedQkv {
    /// Stacked down factors, (3 * rank, in_features)
    pub down: Tensor,
    /// Block-diagonal up factor, (3 * split, 3 * rank)
    pub up: Tensor,
    /// Query alpha times three, when an alpha was supplied
    pub alpha: Option<Tensor>,
}

/// Fuse query, key and value pairs
///
/// All three projections are assumed to share the query's output width. A key
/// or value of a different width, or a different rank, fails with a shape
/// error rather than being corrected.
pub fn fuse_qkv(
    query: LoraPair,
    key: LoraPair,
    value: LoraPair,
    query_alpha: Option<&Tensor>,
) -> Result<FusedQkv> {
    let split = query.up.dim(0)?;
    let rank = query.rank()?;
    let pairs = [query, key, value];

    let down = Tensor::cat(&[&pairs[0].down, &pairs[1].down, &pairs[2].down], 0)?;

    let mut up = Tensor::zeros(
        (split * pairs.len(), down.dim(0)?),
        down.dtype(),
        down.device(),
    )?;
    for (i, pair) in pairs.iter().enumerate() {
        let rows = i * split..(i + 1) * split;
        let cols = i * rank..(i + 1) * rank;
        up = up.slice_assign(&[rows, cols], &pair.up.to_dtype(down.dtype())?)?;
    }

    let alpha = query_alpha
        .map(|alpha| alpha.affine(QKV_ALPHA_FACTOR, 0.0))
        .transpose()?;

    debug!(
        "Fused QKV: down {:?}, up {:?}, rank {} -> {}",
        down.dims(),
        up.dims(),
        rank,
        down.dim(0)?
    );

    Ok(FusedQkv { down, up, alpha })
}
