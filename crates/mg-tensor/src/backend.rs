use std::fmt::Debug;

use crate::error::Result;

/// Score assigned to masked attention positions before the softmax.
///
/// A large finite negative value rather than `-inf`, so that a query with no
/// visible key degrades to a uniform distribution instead of NaN.
pub const MASKED_SCORE: f32 = -1e9;

/// Elementwise activation applied by dense layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Identity.
    Linear,
    /// max(0, x).
    Relu,
    /// Gaussian error linear unit (tanh approximation).
    Gelu,
}

/// Dimensions of a batched multi-head attention call.
///
/// Layouts (row-major):
/// - query: `[batch, query_len, num_heads, head_dim]`
/// - key, value: `[batch, key_len, num_heads, head_dim]`
/// - mask: `[batch, query_len, key_len]`, `true` where attention is allowed
/// - output: `[batch, query_len, num_heads, head_dim]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub batch: usize,
    pub query_len: usize,
    pub key_len: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl AttentionDims {
    pub fn query_numel(&self) -> usize {
        self.batch * self.query_len * self.num_heads * self.head_dim
    }

    pub fn key_numel(&self) -> usize {
        self.batch * self.key_len * self.num_heads * self.head_dim
    }

    pub fn mask_numel(&self) -> usize {
        self.batch * self.query_len * self.key_len
    }
}

/// Trait for pluggable compute backends.
///
/// These are the numerical kernels the decoder is built from. Data is passed
/// in as slices and returned as owned vectors. Implementations must be
/// deterministic: two backends that both satisfy this contract are expected
/// to produce identical results for identical inputs.
pub trait ComputeBackend: Send + Sync + Debug {
    /// Returns the name of this backend (e.g., "cpu", "cpu-parallel").
    fn name(&self) -> &str;

    /// Matrix multiplication: C = A @ B.
    ///
    /// - `a`: row-major data of shape [m, k]
    /// - `b`: row-major data of shape [k, n]
    /// - Returns: row-major data of shape [m, n]
    fn matmul(&self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>>;

    /// Element-wise addition: result[i] = a[i] + b[i].
    fn add(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>>;

    /// Scalar multiplication: result[i] = a[i] * s.
    fn scale(&self, a: &[f32], s: f32) -> Result<Vec<f32>>;

    /// Adds `bias` to every row of `x`, where rows have `bias.len()` elements.
    fn bias_add(&self, x: &[f32], bias: &[f32]) -> Result<Vec<f32>>;

    /// Layer normalization over rows of `hidden_size` elements:
    ///   result[i] = (x[i] - mean) / sqrt(var + eps) * gamma[i] + beta[i]
    fn layer_norm(
        &self,
        x: &[f32],
        gamma: &[f32],
        beta: &[f32],
        eps: f32,
        hidden_size: usize,
    ) -> Result<Vec<f32>>;

    /// Softmax over chunks of `n` elements.
    fn softmax(&self, x: &[f32], n: usize) -> Result<Vec<f32>>;

    /// Log-softmax over chunks of `n` elements.
    fn log_softmax(&self, x: &[f32], n: usize) -> Result<Vec<f32>>;

    /// Elementwise activation.
    fn activation(&self, x: &[f32], activation: Activation) -> Result<Vec<f32>>;

    /// Masked scaled dot-product attention, see [`AttentionDims`] for layouts.
    ///
    /// Scores are scaled by `1/sqrt(head_dim)`; scores where the mask is
    /// `false` are replaced by [`MASKED_SCORE`] before the softmax.
    fn attention(
        &self,
        query: &[f32],
        key: &[f32],
        value: &[f32],
        mask: &[bool],
        dims: AttentionDims,
    ) -> Result<Vec<f32>>;
}
