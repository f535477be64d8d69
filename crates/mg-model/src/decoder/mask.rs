use super::index::CacheUpdateIndex;
use crate::error::{ModelError, Result};

/// Boolean attention mask of shape `[batch, query_len, key_len]`;
/// `true` means the query may attend to the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMask {
    data: Vec<bool>,
    batch: usize,
    query_len: usize,
    key_len: usize,
}

impl AttentionMask {
    /// Mask that allows everything.
    pub fn full(batch: usize, query_len: usize, key_len: usize) -> Self {
        AttentionMask {
            data: vec![true; batch * query_len * key_len],
            batch,
            query_len,
            key_len,
        }
    }

    /// Causal mask: query `i` may attend key `j` only when `j <= i`, where
    /// `i` is the query's absolute position.
    ///
    /// Without an index, query positions are `0..query_len`. With a cache
    /// index, row `b`'s query `q` sits at the index's `q`-th position for
    /// that row; queries past the row's length are padding and see nothing.
    pub fn causal(
        batch: usize,
        query_len: usize,
        key_len: usize,
        index: Option<&CacheUpdateIndex>,
    ) -> Self {
        let positions: Vec<Option<usize>> = match index {
            Some(index) => index.dense_positions(query_len),
            None => (0..batch).flat_map(|_| (0..query_len).map(Some)).collect(),
        };

        let mut data = vec![false; batch * query_len * key_len];
        for (row, position) in positions.into_iter().enumerate() {
            if let Some(i) = position {
                let visible = (i + 1).min(key_len);
                data[row * key_len..row * key_len + visible].fill(true);
            }
        }
        AttentionMask {
            data,
            batch,
            query_len,
            key_len,
        }
    }

    /// Broadcast a per-key validity mask `[batch, key_len]` over all queries.
    pub fn from_padding(key_valid: &[bool], batch: usize, query_len: usize) -> Result<Self> {
        if batch == 0 || key_valid.len() % batch != 0 {
            return Err(ModelError::Other(format!(
                "padding mask of length {} does not split into {} rows",
                key_valid.len(),
                batch
            )));
        }
        let key_len = key_valid.len() / batch;
        let mut data = Vec::with_capacity(batch * query_len * key_len);
        if key_len > 0 {
            for row in key_valid.chunks(key_len) {
                for _ in 0..query_len {
                    data.extend_from_slice(row);
                }
            }
        }
        Ok(AttentionMask {
            data,
            batch,
            query_len,
            key_len,
        })
    }

    /// Elementwise minimum (logical AND) of two masks of the same shape.
    pub fn minimum(&self, other: &AttentionMask) -> Result<AttentionMask> {
        if self.dims() != other.dims() {
            return Err(ModelError::Other(format!(
                "cannot combine masks of shapes {:?} and {:?}",
                self.dims(),
                other.dims()
            )));
        }
        Ok(AttentionMask {
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| *a && *b)
                .collect(),
            batch: self.batch,
            query_len: self.query_len,
            key_len: self.key_len,
        })
    }

    /// `(batch, query_len, key_len)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.batch, self.query_len, self.key_len)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    pub fn allows(&self, b: usize, q: usize, k: usize) -> bool {
        self.data[(b * self.query_len + q) * self.key_len + k]
    }
}
