use rand::Rng;

use mg_tensor::{AttentionDims, ComputeBackend, Shape, Tensor};

use super::cache::LayerCache;
use super::index::CacheUpdateIndex;
use super::mask::AttentionMask;
use super::weights::Dense;
use crate::error::{ModelError, Result};

/// Result of an attention call: the projected output and, when a cache was
/// supplied, that cache after this call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, query_len, hidden]`.
    pub output: Tensor,
    pub cache: Option<LayerCache>,
}

/// Multi-head attention that can read from and write to a [`LayerCache`].
#[derive(Debug, Clone)]
pub struct CachedMultiHeadAttention {
    pub query: Dense,
    pub key: Dense,
    pub value: Dense,
    pub output: Dense,
    num_heads: usize,
    head_dim: usize,
}

impl CachedMultiHeadAttention {
    pub fn new(
        query: Dense,
        key: Dense,
        value: Dense,
        output: Dense,
        num_heads: usize,
        head_dim: usize,
    ) -> Result<Self> {
        let width = num_heads * head_dim;
        if query.out_dim() != width || key.out_dim() != width || value.out_dim() != width {
            return Err(ModelError::InvalidConfig(format!(
                "q/k/v projections must produce {} features",
                width
            )));
        }
        if output.in_dim() != width {
            return Err(ModelError::InvalidConfig(format!(
                "output projection expects {} features, got {}",
                width,
                output.in_dim()
            )));
        }
        Ok(CachedMultiHeadAttention {
            query,
            key,
            value,
            output,
            num_heads,
            head_dim,
        })
    }

    /// Glorot-initialised projections for a `hidden`-wide model.
    pub fn initialize<R: Rng + ?Sized>(
        hidden: usize,
        num_heads: usize,
        head_dim: usize,
        rng: &mut R,
    ) -> Self {
        let width = num_heads * head_dim;
        CachedMultiHeadAttention {
            query: Dense::glorot(hidden, width, rng),
            key: Dense::glorot(hidden, width, rng),
            value: Dense::glorot(hidden, width, rng),
            output: Dense::glorot(width, hidden, rng),
            num_heads,
            head_dim,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Attend `query` (`[batch, query_len, hidden]`) over keys/values.
    ///
    /// - no cache: keys and values are projected from `value`.
    /// - cache without index: the cache already holds the complete keys and
    ///   values (e.g. an encoded source sequence) and is returned unchanged.
    /// - cache with index: the projections of `value` are written into the
    ///   cache at the indexed positions, then the query attends over every
    ///   cache position. The mask decides which positions are visible.
    pub fn attend(
        &self,
        query: &Tensor,
        value: &Tensor,
        mask: Option<&AttentionMask>,
        cache: Option<LayerCache>,
        index: Option<&CacheUpdateIndex>,
        backend: &dyn ComputeBackend,
    ) -> Result<AttentionOutput> {
        let (batch, query_len) = sequence_dims(query)?;
        let q = self.split_heads(self.query.forward(query, backend)?)?;

        let (key, value, cache) = match (cache, index) {
            (None, _) => {
                let k = self.split_heads(self.key.forward(value, backend)?)?;
                let v = self.split_heads(self.value.forward(value, backend)?)?;
                (k, v, None)
            }
            (Some(cache), None) => (cache.key()?, cache.value()?, Some(cache)),
            (Some(cache), Some(index)) => {
                let k_update = self.split_heads(self.key.forward(value, backend)?)?;
                let v_update = self.split_heads(self.value.forward(value, backend)?)?;
                let cache = cache.update(index, &k_update, &v_update)?;
                (cache.key()?, cache.value()?, Some(cache))
            }
        };

        let key_len = key.shape().dim(1);
        let dims = AttentionDims {
            batch,
            query_len,
            key_len,
            num_heads: self.num_heads,
            head_dim: self.head_dim,
        };
        let full;
        let mask = match mask {
            Some(mask) => {
                if mask.dims() != (batch, query_len, key_len) {
                    return Err(ModelError::Other(format!(
                        "attention mask {:?} does not match (batch, query, key) = {:?}",
                        mask.dims(),
                        (batch, query_len, key_len)
                    )));
                }
                mask
            }
            None => {
                full = AttentionMask::full(batch, query_len, key_len);
                &full
            }
        };

        let attended = backend.attention(q.data(), key.data(), value.data(), mask.as_slice(), dims)?;
        let merged = Tensor::try_new(
            attended,
            Shape::new(vec![batch, query_len, self.num_heads * self.head_dim]),
        )?;
        Ok(AttentionOutput {
            output: self.output.forward(&merged, backend)?,
            cache,
        })
    }

    /// `[batch, len, heads * head_dim] -> [batch, len, heads, head_dim]`.
    fn split_heads(&self, x: Tensor) -> Result<Tensor> {
        let (batch, len) = sequence_dims(&x)?;
        Ok(x.reshape(Shape::new(vec![batch, len, self.num_heads, self.head_dim]))?)
    }
}

/// `(batch, length)` of a `[batch, length, features]` tensor.
pub(crate) fn sequence_dims(x: &Tensor) -> Result<(usize, usize)> {
    let dims = x.shape().dims();
    if dims.len() != 3 {
        return Err(ModelError::Other(format!(
            "expected a [batch, length, features] tensor, got {}",
            x.shape()
        )));
    }
    Ok((dims[0], dims[1]))
}
