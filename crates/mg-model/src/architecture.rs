use mg_tensor::ComputeBackend;

use crate::decoder::{AttentionCache, DecoderInput, DecoderOutput};

/// Trait for decoder models that support incremental, cache-indexed decoding.
///
/// Implementations hold read-only weights; all per-call state (caches and
/// update indices) travels in [`DecoderInput`] and comes back in
/// [`DecoderOutput`], so one model can serve concurrent generation calls.
pub trait DecoderModel: Send + Sync {
    /// Run the decoder over `input.tokens`.
    ///
    /// Returns logits for every input position, plus exactly the caches that
    /// were supplied in `input`, updated.
    fn forward(
        &self,
        input: DecoderInput<'_>,
        backend: &dyn ComputeBackend,
    ) -> crate::Result<DecoderOutput>;

    /// Returns an all-zero cache of shape
    /// `[batch_size, num_layers, 2, max_length, num_heads, head_dim]`.
    fn initialize_attention_cache(&self, batch_size: usize, max_length: usize) -> AttentionCache {
        AttentionCache::zeros(
            batch_size,
            self.num_layers(),
            max_length,
            self.num_heads(),
            self.head_dim(),
        )
    }

    /// Number of learned positions, and therefore the longest sequence the
    /// model can decode.
    fn sequence_length(&self) -> usize;

    fn num_layers(&self) -> usize;

    fn num_heads(&self) -> usize;

    fn head_dim(&self) -> usize;

    /// Returns the vocabulary size (number of output logits).
    fn vocabulary_size(&self) -> usize;
}

