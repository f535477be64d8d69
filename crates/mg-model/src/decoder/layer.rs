use rand::Rng;

use mg_tensor::{ComputeBackend, Tensor};

use super::attention::{sequence_dims, CachedMultiHeadAttention};
use super::cache::LayerCache;
use super::config::DecoderConfig;
use super::index::CacheUpdateIndex;
use super::mask::AttentionMask;
use super::weights::{Dense, Embedding, LayerNorm};
use crate::error::{ModelError, Result};

/// Cross-attention sublayer over an encoded sequence.
#[derive(Debug, Clone)]
pub struct CrossAttention {
    pub attention: CachedMultiHeadAttention,
    pub norm: LayerNorm,
}

/// One transformer decoder block: self attention, optional cross attention
/// and a two-layer feed-forward network, each wrapped in a residual add and
/// a layer norm.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    pub self_attention: CachedMultiHeadAttention,
    pub self_attention_norm: LayerNorm,
    pub cross_attention: Option<CrossAttention>,
    pub intermediate: Dense,
    pub output: Dense,
    pub feedforward_norm: LayerNorm,
    normalize_first: bool,
}

/// Everything one layer call reads. Caches are moved in and come back in
/// [`LayerOutput`].
#[derive(Debug, Clone)]
pub struct LayerInput<'a> {
    /// `[batch, len, hidden]`.
    pub decoder_sequence: &'a Tensor,
    /// `[batch, encoder_len, hidden]`; required exactly when the layer has
    /// cross attention.
    pub encoder_sequence: Option<&'a Tensor>,
    /// Key validity for self attention, `[batch, key_len]`.
    pub decoder_padding_mask: Option<&'a [bool]>,
    /// Key validity for cross attention, `[batch, encoder_len]`.
    pub encoder_padding_mask: Option<&'a [bool]>,
    pub self_cache: Option<LayerCache>,
    pub self_index: Option<&'a CacheUpdateIndex>,
    pub cross_cache: Option<LayerCache>,
    pub cross_index: Option<&'a CacheUpdateIndex>,
    pub use_causal_mask: bool,
}

impl<'a> LayerInput<'a> {
    /// Causal, uncached input with no encoder.
    pub fn new(decoder_sequence: &'a Tensor) -> Self {
        LayerInput {
            decoder_sequence,
            encoder_sequence: None,
            decoder_padding_mask: None,
            encoder_padding_mask: None,
            self_cache: None,
            self_index: None,
            cross_cache: None,
            cross_index: None,
            use_causal_mask: true,
        }
    }

    pub fn with_encoder(mut self, encoder_sequence: &'a Tensor) -> Self {
        self.encoder_sequence = Some(encoder_sequence);
        self
    }

    pub fn with_self_cache(mut self, cache: LayerCache, index: Option<&'a CacheUpdateIndex>) -> Self {
        self.self_cache = Some(cache);
        self.self_index = index;
        self
    }

    pub fn with_cross_cache(mut self, cache: LayerCache, index: Option<&'a CacheUpdateIndex>) -> Self {
        self.cross_cache = Some(cache);
        self.cross_index = index;
        self
    }

    pub fn with_padding_masks(
        mut self,
        decoder: Option<&'a [bool]>,
        encoder: Option<&'a [bool]>,
    ) -> Self {
        self.decoder_padding_mask = decoder;
        self.encoder_padding_mask = encoder;
        self
    }

    pub fn causal(mut self, use_causal_mask: bool) -> Self {
        self.use_causal_mask = use_causal_mask;
        self
    }
}

/// Output of one layer call. Each cache is `Some` exactly when the matching
/// cache was supplied in the [`LayerInput`].
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub hidden: Tensor,
    pub self_cache: Option<LayerCache>,
    pub cross_cache: Option<LayerCache>,
}

impl DecoderLayer {
    pub fn initialize<R: Rng + ?Sized>(config: &DecoderConfig, rng: &mut R) -> Self {
        let hidden = config.embedding_dim;
        let heads = config.num_heads;
        let head_dim = config.head_dim();
        let eps = config.layer_norm_epsilon;

        let self_attention = CachedMultiHeadAttention::initialize(hidden, heads, head_dim, rng);
        let cross_attention = config.cross_attention.then(|| CrossAttention {
            attention: CachedMultiHeadAttention::initialize(hidden, heads, head_dim, rng),
            norm: LayerNorm::new(hidden, eps),
        });
        DecoderLayer {
            self_attention,
            self_attention_norm: LayerNorm::new(hidden, eps),
            cross_attention,
            intermediate: Dense::glorot(hidden, config.intermediate_dim, rng)
                .with_activation(config.activation.into()),
            output: Dense::glorot(config.intermediate_dim, hidden, rng),
            feedforward_norm: LayerNorm::new(hidden, eps),
            normalize_first: config.normalize_first,
        }
    }

    pub fn normalize_first(&self) -> bool {
        self.normalize_first
    }

    pub fn has_cross_attention(&self) -> bool {
        self.cross_attention.is_some()
    }

    pub fn forward(&self, input: LayerInput<'_>, backend: &dyn ComputeBackend) -> Result<LayerOutput> {
        let LayerInput {
            decoder_sequence,
            encoder_sequence,
            decoder_padding_mask,
            encoder_padding_mask,
            self_cache,
            self_index,
            cross_cache,
            cross_index,
            use_causal_mask,
        } = input;

        let (batch, len) = sequence_dims(decoder_sequence)?;

        // Self attention.
        let key_len = self_cache.as_ref().map_or(len, LayerCache::max_length);
        let self_mask = self_attention_mask(
            batch,
            len,
            key_len,
            self_index,
            use_causal_mask,
            decoder_padding_mask,
        )?;
        let normed;
        let x = if self.normalize_first {
            normed = self.self_attention_norm.forward(decoder_sequence, backend)?;
            &normed
        } else {
            decoder_sequence
        };
        let attended = self.self_attention.attend(
            x,
            x,
            self_mask.as_ref(),
            self_cache,
            self_index,
            backend,
        )?;
        let self_cache = attended.cache;
        let mut hidden = self.residual(decoder_sequence, &attended.output, &self.self_attention_norm, backend)?;

        // Cross attention.
        let cross_cache = match (&self.cross_attention, encoder_sequence) {
            (Some(cross), Some(encoder)) => {
                let (_, encoder_len) = sequence_dims(encoder)?;
                let key_len = cross_cache.as_ref().map_or(encoder_len, LayerCache::max_length);
                let cross_mask = encoder_padding_mask
                    .map(|valid| AttentionMask::from_padding(valid, batch, len))
                    .transpose()?;
                if let Some(mask) = &cross_mask {
                    if mask.dims().2 != key_len {
                        return Err(ModelError::Other(format!(
                            "encoder padding mask covers {} keys, cross attention sees {}",
                            mask.dims().2,
                            key_len
                        )));
                    }
                }
                let normed;
                let x = if self.normalize_first {
                    normed = cross.norm.forward(&hidden, backend)?;
                    &normed
                } else {
                    &hidden
                };
                let attended = cross.attention.attend(
                    x,
                    encoder,
                    cross_mask.as_ref(),
                    cross_cache,
                    cross_index,
                    backend,
                )?;
                hidden = self.residual(&hidden, &attended.output, &cross.norm, backend)?;
                attended.cache
            }
            (None, Some(_)) => return Err(ModelError::UnexpectedEncoderOutput),
            (Some(_), None) => return Err(ModelError::MissingEncoderOutput),
            (None, None) => cross_cache,
        };

        // Feed-forward.
        let normed;
        let x = if self.normalize_first {
            normed = self.feedforward_norm.forward(&hidden, backend)?;
            &normed
        } else {
            &hidden
        };
        let projected = self.output.forward(&self.intermediate.forward(x, backend)?, backend)?;
        let hidden = self.residual(&hidden, &projected, &self.feedforward_norm, backend)?;

        Ok(LayerOutput {
            hidden,
            self_cache,
            cross_cache,
        })
    }

    /// `residual + update`, normalised afterwards in post-norm layers.
    fn residual(
        &self,
        residual: &Tensor,
        update: &Tensor,
        norm: &LayerNorm,
        backend: &dyn ComputeBackend,
    ) -> Result<Tensor> {
        let sum = Tensor::try_new(backend.add(residual.data(), update.data())?, residual.shape().clone())?;
        if self.normalize_first {
            Ok(sum)
        } else {
            norm.forward(&sum, backend)
        }
    }
}

/// All weights of a [`TransformerDecoder`](super::TransformerDecoder).
#[derive(Debug, Clone)]
pub struct DecoderWeights {
    /// `[vocabulary_size, embedding_dim]`.
    pub token_embedding: Embedding,
    /// `[sequence_length, embedding_dim]`, learned.
    pub position_embedding: Embedding,
    pub layers: Vec<DecoderLayer>,
    /// Projection to vocabulary logits.
    pub output: Dense,
}

impl DecoderWeights {
    /// Fresh weights: glorot-uniform kernels, zero biases, uniform(-0.05, 0.05)
    /// embeddings, unit-scale layer norms.
    pub fn initialize<R: Rng + ?Sized>(config: &DecoderConfig, rng: &mut R) -> Self {
        let token_embedding = Embedding::uniform(config.vocabulary_size, config.embedding_dim, rng);
        let position_embedding = Embedding::uniform(config.sequence_length, config.embedding_dim, rng);
        let layers = (0..config.num_layers)
            .map(|_| DecoderLayer::initialize(config, rng))
            .collect();
        DecoderWeights {
            token_embedding,
            position_embedding,
            layers,
            output: Dense::glorot(config.embedding_dim, config.vocabulary_size, rng),
        }
    }

    /// Check that the weights fit `config`.
    pub fn check(&self, config: &DecoderConfig) -> Result<()> {
        let ensure = |what: &str, got: usize, want: usize| {
            if got == want {
                Ok(())
            } else {
                Err(ModelError::InvalidConfig(format!(
                    "{}: expected {}, got {}",
                    what, want, got
                )))
            }
        };
        ensure("token embedding rows", self.token_embedding.rows(), config.vocabulary_size)?;
        ensure("token embedding width", self.token_embedding.dim(), config.embedding_dim)?;
        ensure("position embedding rows", self.position_embedding.rows(), config.sequence_length)?;
        ensure("position embedding width", self.position_embedding.dim(), config.embedding_dim)?;
        ensure("layer count", self.layers.len(), config.num_layers)?;
        ensure("output width", self.output.out_dim(), config.vocabulary_size)?;
        for layer in &self.layers {
            ensure("attention heads", layer.self_attention.num_heads(), config.num_heads)?;
            ensure("head size", layer.self_attention.head_dim(), config.head_dim())?;
            if layer.has_cross_attention() != config.cross_attention {
                return Err(ModelError::InvalidConfig(
                    "cross attention weights do not match the configuration".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Minimum of the causal mask and the padding mask, whichever are enabled.
/// `None` means every key is visible.
fn self_attention_mask(
    batch: usize,
    query_len: usize,
    key_len: usize,
    index: Option<&CacheUpdateIndex>,
    use_causal_mask: bool,
    padding: Option<&[bool]>,
) -> Result<Option<AttentionMask>> {
    let causal = use_causal_mask.then(|| AttentionMask::causal(batch, query_len, key_len, index));
    let padding = padding
        .map(|valid| AttentionMask::from_padding(valid, batch, query_len))
        .transpose()?;
    match (causal, padding) {
        (Some(causal), Some(padding)) => Ok(Some(causal.minimum(&padding)?)),
        (causal, padding) => Ok(causal.or(padding)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use mg_tensor::{CpuBackend, Shape};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(cross_attention: bool, normalize_first: bool) -> DecoderConfig {
        DecoderConfig {
            num_layers: 1,
            num_heads: 2,
            embedding_dim: 8,
            intermediate_dim: 16,
            vocabulary_size: 6,
            sequence_length: 8,
            cross_attention,
            normalize_first,
            ..DecoderConfig::default()
        }
    }

    fn sequence(batch: usize, len: usize, seed: f32) -> Tensor {
        Tensor::from_fn(Shape::new(vec![batch, len, 8]), |i| (i as f32 * seed).cos())
    }

    fn slice_position(x: &Tensor, b: usize, p: usize) -> Tensor {
        let len = x.shape().dim(1);
        let start = (b * len + p) * 8;
        Tensor::new(x.data()[start..start + 8].to_vec(), Shape::new(vec![1, 1, 8]))
    }

    #[test]
    fn test_output_arity_follows_input() {
        let backend = CpuBackend::new();
        let layer = DecoderLayer::initialize(&config(false, false), &mut StdRng::seed_from_u64(1));
        let x = sequence(1, 3, 0.3);

        let plain = layer.forward(LayerInput::new(&x), &backend).unwrap();
        assert_eq!(plain.hidden.shape().dims(), &[1, 3, 8]);
        assert!(plain.self_cache.is_none());
        assert!(plain.cross_cache.is_none());

        let index = CacheUpdateIndex::range(&[3]);
        let cached = layer
            .forward(
                LayerInput::new(&x).with_self_cache(LayerCache::zeros(1, 5, 2, 4), Some(&index)),
                &backend,
            )
            .unwrap();
        assert!(cached.self_cache.is_some());
        assert!(cached.cross_cache.is_none());
        for (a, b) in cached.hidden.data().iter().zip(plain.hidden.data()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_cached_steps_match_full_pass() {
        for normalize_first in [false, true] {
            let backend = CpuBackend::new();
            let layer = DecoderLayer::initialize(
                &config(false, normalize_first),
                &mut StdRng::seed_from_u64(2),
            );
            let x = sequence(1, 4, 0.17);
            let full = layer.forward(LayerInput::new(&x), &backend).unwrap();

            let mut cache = LayerCache::zeros(1, 4, 2, 4);
            for p in 0..4 {
                let token = slice_position(&x, 0, p);
                let index = CacheUpdateIndex::per_row(&[p]);
                let out = layer
                    .forward(
                        LayerInput::new(&token).with_self_cache(cache, Some(&index)),
                        &backend,
                    )
                    .unwrap();
                cache = out.self_cache.unwrap();
                let expected = slice_position(&full.hidden, 0, p);
                for (a, b) in out.hidden.data().iter().zip(expected.data()) {
                    assert_abs_diff_eq!(a, b, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_encoder_presence_must_match_layer() {
        let backend = CpuBackend::new();
        let x = sequence(1, 2, 0.5);
        let encoder = sequence(1, 3, 0.9);

        let self_only = DecoderLayer::initialize(&config(false, false), &mut StdRng::seed_from_u64(3));
        assert!(matches!(
            self_only.forward(LayerInput::new(&x).with_encoder(&encoder), &backend),
            Err(ModelError::UnexpectedEncoderOutput)
        ));

        let with_cross = DecoderLayer::initialize(&config(true, false), &mut StdRng::seed_from_u64(3));
        assert!(matches!(
            with_cross.forward(LayerInput::new(&x), &backend),
            Err(ModelError::MissingEncoderOutput)
        ));
        let out = with_cross
            .forward(LayerInput::new(&x).with_encoder(&encoder), &backend)
            .unwrap();
        assert_eq!(out.hidden.shape().dims(), &[1, 2, 8]);
    }

    #[test]
    fn test_primed_cross_cache_matches_uncached_cross_attention() {
        let backend = CpuBackend::new();
        let layer = DecoderLayer::initialize(&config(true, false), &mut StdRng::seed_from_u64(4));
        let x = sequence(1, 1, 0.4);
        let encoder = sequence(1, 3, 0.8);

        let direct = layer
            .forward(LayerInput::new(&x).with_encoder(&encoder), &backend)
            .unwrap();

        let cross_index = CacheUpdateIndex::range(&[3]);
        let primed = layer
            .forward(
                LayerInput::new(&x)
                    .with_encoder(&encoder)
                    .with_cross_cache(LayerCache::zeros(1, 3, 2, 4), Some(&cross_index)),
                &backend,
            )
            .unwrap();
        let cross_cache = primed.cross_cache.unwrap();

        // Reusing the primed cache without an index must not change anything.
        let reused = layer
            .forward(
                LayerInput::new(&x)
                    .with_encoder(&encoder)
                    .with_cross_cache(cross_cache.clone(), None),
                &backend,
            )
            .unwrap();
        assert_eq!(reused.cross_cache.as_ref(), Some(&cross_cache));
        for (a, b) in reused.hidden.data().iter().zip(direct.hidden.data()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_padding_mask_hides_keys() {
        let backend = CpuBackend::new();
        let layer = DecoderLayer::initialize(&config(false, false), &mut StdRng::seed_from_u64(5));
        let x = sequence(1, 3, 0.6);
        let mut changed = x.clone();
        for d in 0..8 {
            changed.set(&[0, 1, d], 7.0).unwrap();
        }
        let valid = [true, false, true];
        let run = |seq: &Tensor| {
            layer
                .forward(
                    LayerInput::new(seq).with_padding_masks(Some(&valid[..]), None).causal(false),
                    &backend,
                )
                .unwrap()
        };
        let (a, b) = (run(&x), run(&changed));
        // Positions 0 and 2 never see key 1.
        for p in [0, 2] {
            let (pa, pb) = (slice_position(&a.hidden, 0, p), slice_position(&b.hidden, 0, p));
            for (u, v) in pa.data().iter().zip(pb.data()) {
                assert_abs_diff_eq!(u, v, epsilon = 1e-6);
            }
        }
    }
}
