use mg_tensor::{Shape, Tensor};

use super::index::CacheUpdateIndex;
use crate::error::{ModelError, Result};

/// Key/value cache for every layer of a decoder.
///
/// Layout: `[batch, layers, 2, max_length, heads, head_dim]`, where axis 2
/// separates keys (0) from values (1). The layer axis is always second so a
/// per-layer slice is a single `select(1, i)`.
///
/// A cache belongs to one generation call. Positions that were never written
/// hold zeros; masking, not the cache, keeps them out of attention.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionCache {
    tensor: Tensor,
}

impl AttentionCache {
    /// All-zero cache.
    pub fn zeros(
        batch_size: usize,
        num_layers: usize,
        max_length: usize,
        num_heads: usize,
        head_dim: usize,
    ) -> Self {
        AttentionCache {
            tensor: Tensor::zeros(Shape::new(vec![
                batch_size, num_layers, 2, max_length, num_heads, head_dim,
            ])),
        }
    }

    /// Wrap an existing tensor, checking that it has the cache layout.
    pub fn from_tensor(tensor: Tensor) -> Result<Self> {
        let dims = tensor.shape().dims();
        if dims.len() != 6 || dims[2] != 2 {
            return Err(ModelError::CacheShapeMismatch {
                expected: vec![0, 0, 2, 0, 0, 0],
                got: dims.to_vec(),
            });
        }
        Ok(AttentionCache { tensor })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    pub fn batch_size(&self) -> usize {
        self.tensor.shape().dim(0)
    }

    pub fn num_layers(&self) -> usize {
        self.tensor.shape().dim(1)
    }

    pub fn max_length(&self) -> usize {
        self.tensor.shape().dim(3)
    }

    pub fn num_heads(&self) -> usize {
        self.tensor.shape().dim(4)
    }

    pub fn head_dim(&self) -> usize {
        self.tensor.shape().dim(5)
    }

    /// The cache of layer `i`, `[batch, 2, max_length, heads, head_dim]`.
    pub fn layer(&self, i: usize) -> Result<LayerCache> {
        Ok(LayerCache {
            tensor: self.tensor.select(1, i)?,
        })
    }

    /// Re-stack per-layer caches along the layer axis.
    pub fn from_layers(layers: &[LayerCache]) -> Result<Self> {
        let tensors: Vec<Tensor> = layers.iter().map(|l| l.tensor.clone()).collect();
        Ok(AttentionCache {
            tensor: Tensor::stack(&tensors, 1)?,
        })
    }
}

/// Key/value cache of a single attention block:
/// `[batch, 2, max_length, heads, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerCache {
    tensor: Tensor,
}

impl LayerCache {
    pub fn zeros(batch_size: usize, max_length: usize, num_heads: usize, head_dim: usize) -> Self {
        LayerCache {
            tensor: Tensor::zeros(Shape::new(vec![
                batch_size, 2, max_length, num_heads, head_dim,
            ])),
        }
    }

    /// Build a cache from complete key and value tensors of shape
    /// `[batch, length, heads, head_dim]`.
    pub fn from_key_value(key: &Tensor, value: &Tensor) -> Result<Self> {
        if key.shape().ndim() != 4 {
            return Err(ModelError::CacheShapeMismatch {
                expected: vec![0, 0, 0, 0],
                got: key.shape().dims().to_vec(),
            });
        }
        Ok(LayerCache {
            tensor: Tensor::stack(&[key.clone(), value.clone()], 1)?,
        })
    }

    /// Replace the whole cache with complete key and value tensors.
    ///
    /// This is the update without an index: the replacement must have the
    /// cache's batch size and head layout but may change its length.
    pub fn replace(self, key: &Tensor, value: &Tensor) -> Result<LayerCache> {
        let length = key.shape().dims().get(1).copied().unwrap_or(0);
        let expected = [self.batch_size(), length, self.num_heads(), self.head_dim()];
        if key.shape().dims() != expected || value.shape() != key.shape() {
            return Err(ModelError::CacheShapeMismatch {
                expected: expected.to_vec(),
                got: value.shape().dims().to_vec(),
            });
        }
        LayerCache::from_key_value(key, value)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn batch_size(&self) -> usize {
        self.tensor.shape().dim(0)
    }

    pub fn max_length(&self) -> usize {
        self.tensor.shape().dim(2)
    }

    pub fn num_heads(&self) -> usize {
        self.tensor.shape().dim(3)
    }

    pub fn head_dim(&self) -> usize {
        self.tensor.shape().dim(4)
    }

    /// Cached keys, `[batch, max_length, heads, head_dim]`.
    pub fn key(&self) -> Result<Tensor> {
        Ok(self.tensor.select(1, 0)?)
    }

    /// Cached values, `[batch, max_length, heads, head_dim]`.
    pub fn value(&self) -> Result<Tensor> {
        Ok(self.tensor.select(1, 1)?)
    }

    /// Write `key_update`/`value_update` (`[batch, len, heads, head_dim]`)
    /// at the positions named by `index` and return the updated cache.
    ///
    /// Flat position `j` of the index reads the update at its gather index
    /// `(row, local rank)` and writes it at its scatter index
    /// `(row, absolute position)`. Every other position is left untouched.
    ///
    /// # Panics
    /// Positions are not range-checked in release builds; a position at or
    /// beyond `max_length` panics on the slice access.
    pub fn update(
        mut self,
        index: &CacheUpdateIndex,
        key_update: &Tensor,
        value_update: &Tensor,
    ) -> Result<LayerCache> {
        let batch = self.batch_size();
        let max_length = self.max_length();
        let block = self.num_heads() * self.head_dim();

        let dims = key_update.shape().dims();
        let expected = [batch, index.max_row_length(), self.num_heads(), self.head_dim()];
        if dims.len() != 4
            || dims[0] != batch
            || dims[1] < expected[1]
            || dims[2] != expected[2]
            || dims[3] != expected[3]
            || value_update.shape() != key_update.shape()
            || index.batch_size() != batch
        {
            return Err(ModelError::CacheShapeMismatch {
                expected: expected.to_vec(),
                got: dims.to_vec(),
            });
        }
        let update_len = dims[1];

        let keys = key_update.data();
        let values = value_update.data();
        let cache = self.tensor.data_mut();
        for ((row, local), (_, pos)) in index.gather_index().into_iter().zip(index.scatter_index()) {
            debug_assert!(pos < max_length, "cache position {} >= {}", pos, max_length);
            let src = (row * update_len + local) * block;
            let key_dst = ((row * 2) * max_length + pos) * block;
            let value_dst = ((row * 2 + 1) * max_length + pos) * block;
            cache[key_dst..key_dst + block].copy_from_slice(&keys[src..src + block]);
            cache[value_dst..value_dst + block].copy_from_slice(&values[src..src + block]);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(dims: Vec<usize>, seed: f32) -> Tensor {
        Tensor::from_fn(Shape::new(dims), |i| seed + i as f32)
    }

    #[test]
    fn test_zeros_shape() {
        let cache = AttentionCache::zeros(2, 3, 5, 4, 8);
        assert_eq!(cache.tensor().shape().dims(), &[2, 3, 2, 5, 4, 8]);
        assert_eq!(cache.num_layers(), 3);
        assert_eq!(cache.max_length(), 5);
        assert!(cache.tensor().data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_from_tensor_rejects_bad_layout() {
        let t = Tensor::zeros(Shape::new(vec![1, 1, 3, 2, 1, 1]));
        assert!(AttentionCache::from_tensor(t).is_err());
    }

    #[test]
    fn test_layer_roundtrip() {
        let t = filled(vec![2, 3, 2, 4, 1, 2], 0.0);
        let cache = AttentionCache::from_tensor(t).unwrap();
        let layers: Vec<LayerCache> = (0..3).map(|i| cache.layer(i).unwrap()).collect();
        assert_eq!(layers[1].tensor().shape().dims(), &[2, 2, 4, 1, 2]);
        assert_eq!(AttentionCache::from_layers(&layers).unwrap(), cache);
    }

    #[test]
    fn test_update_touches_only_indexed_positions() {
        let before = LayerCache::from_key_value(
            &filled(vec![2, 4, 1, 2], 100.0),
            &filled(vec![2, 4, 1, 2], 200.0),
        )
        .unwrap();
        let key = filled(vec![2, 1, 1, 2], -10.0);
        let value = filled(vec![2, 1, 1, 2], -20.0);
        let index = CacheUpdateIndex::per_row(&[3, 1]);

        let after = before.clone().update(&index, &key, &value).unwrap();
        let (k0, k1) = (before.key().unwrap(), after.key().unwrap());
        let (v0, v1) = (before.value().unwrap(), after.value().unwrap());

        for b in 0..2 {
            for pos in 0..4 {
                for d in 0..2 {
                    let at = [b, pos, 0, d];
                    let written = (b == 0 && pos == 3) || (b == 1 && pos == 1);
                    if written {
                        assert_eq!(k1.get(&at).unwrap(), key.get(&[b, 0, 0, d]).unwrap());
                        assert_eq!(v1.get(&at).unwrap(), value.get(&[b, 0, 0, d]).unwrap());
                    } else {
                        assert_eq!(k1.get(&at).unwrap(), k0.get(&at).unwrap());
                        assert_eq!(v1.get(&at).unwrap(), v0.get(&at).unwrap());
                    }
                }
            }
        }
    }

    #[test]
    fn test_ragged_update_reads_local_rank() {
        let cache = LayerCache::zeros(2, 4, 1, 1);
        // Dense update padded to length 3; row 1 only has one real value.
        let key = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 99.0, 99.0], Shape::new(vec![2, 3, 1, 1]));
        let index = CacheUpdateIndex::range(&[3, 1]);
        let cache = cache.update(&index, &key, &key).unwrap();
        assert_eq!(cache.key().unwrap().data(), &[1.0, 2.0, 3.0, 0.0, 4.0, 0.0, 0.0, 0.0]);
        assert_eq!(cache.value().unwrap().data(), cache.key().unwrap().data());
    }

    #[test]
    fn test_replace_swaps_contents() {
        let cache = LayerCache::zeros(1, 4, 1, 2);
        let key = filled(vec![1, 3, 1, 2], 1.0);
        let value = filled(vec![1, 3, 1, 2], 50.0);
        let cache = cache.replace(&key, &value).unwrap();
        assert_eq!(cache.max_length(), 3);
        assert_eq!(cache.key().unwrap(), key);
        assert_eq!(cache.value().unwrap(), value);

        let wrong_heads = Tensor::zeros(Shape::new(vec![1, 3, 2, 1]));
        assert!(cache.replace(&wrong_heads, &wrong_heads).is_err());
    }

    #[test]
    fn test_update_rejects_short_update() {
        let cache = LayerCache::zeros(1, 4, 1, 1);
        let key = Tensor::zeros(Shape::new(vec![1, 1, 1, 1]));
        let index = CacheUpdateIndex::range(&[2]);
        assert!(cache.update(&index, &key, &key).is_err());
    }
}
