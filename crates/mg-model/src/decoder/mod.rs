pub mod attention;
pub mod cache;
pub mod config;
pub mod index;
pub mod layer;
pub mod mask;
pub mod weights;

pub use attention::{AttentionOutput, CachedMultiHeadAttention};
pub use cache::{AttentionCache, LayerCache};
pub use config::{ActivationKind, DecoderConfig};
pub use index::CacheUpdateIndex;
pub use layer::{CrossAttention, DecoderLayer, DecoderWeights, LayerInput, LayerOutput};
pub use mask::AttentionMask;
pub use weights::{Dense, Embedding, LayerNorm};

use rand::Rng;

use mg_tensor::{ComputeBackend, Shape, Tensor};

use crate::architecture::DecoderModel;
use crate::error::{ModelError, Result};
use crate::tokenizer::TokenBatch;

/// Arguments of one decoder call.
///
/// Caches are moved in and handed back in [`DecoderOutput`]. A self cache
/// with an index runs an incremental step (or a priming pass when the index
/// is ragged); without a cache the whole sequence is decoded from scratch.
#[derive(Debug, Clone)]
pub struct DecoderInput<'a> {
    pub tokens: &'a TokenBatch,
    pub self_cache: Option<AttentionCache>,
    pub self_index: Option<&'a CacheUpdateIndex>,
    /// `[batch, encoder_len, embedding_dim]`.
    pub encoder_output: Option<&'a Tensor>,
    /// Key validity over the encoder sequence, `[batch, encoder_len]`.
    pub encoder_padding_mask: Option<&'a [bool]>,
    pub cross_cache: Option<AttentionCache>,
    pub cross_index: Option<&'a CacheUpdateIndex>,
}

impl<'a> DecoderInput<'a> {
    pub fn new(tokens: &'a TokenBatch) -> Self {
        DecoderInput {
            tokens,
            self_cache: None,
            self_index: None,
            encoder_output: None,
            encoder_padding_mask: None,
            cross_cache: None,
            cross_index: None,
        }
    }

    pub fn with_self_cache(mut self, cache: AttentionCache, index: Option<&'a CacheUpdateIndex>) -> Self {
        self.self_cache = Some(cache);
        self.self_index = index;
        self
    }

    pub fn with_encoder_output(mut self, encoder_output: &'a Tensor, padding_mask: Option<&'a [bool]>) -> Self {
        self.encoder_output = Some(encoder_output);
        self.encoder_padding_mask = padding_mask;
        self
    }

    pub fn with_cross_cache(mut self, cache: AttentionCache, index: Option<&'a CacheUpdateIndex>) -> Self {
        self.cross_cache = Some(cache);
        self.cross_index = index;
        self
    }
}

/// Logits for every input position, plus exactly the caches that were
/// supplied in the [`DecoderInput`].
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[batch, len, vocabulary_size]`.
    pub logits: Tensor,
    pub self_cache: Option<AttentionCache>,
    pub cross_cache: Option<AttentionCache>,
}

impl DecoderOutput {
    /// Logits of row `b` at input slot `i`, or `None` when either is out of
    /// range or the logits are not `[batch, len, vocabulary_size]`.
    pub fn logits_at(&self, b: usize, i: usize) -> Option<&[f32]> {
        let (batch, len, vocab) = match *self.logits.shape().dims() {
            [batch, len, vocab] => (batch, len, vocab),
            _ => return None,
        };
        if b >= batch || i >= len {
            return None;
        }
        let start = (b * len + i) * vocab;
        self.logits.data().get(start..start + vocab)
    }
}

/// Decoder-only transformer: token and learned position embeddings, a stack
/// of [`DecoderLayer`]s and a dense projection to vocabulary logits.
///
/// Weights are read-only after construction; every call's state lives in its
/// [`DecoderInput`], so a shared reference can serve concurrent callers.
#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    config: DecoderConfig,
    weights: DecoderWeights,
}

impl TransformerDecoder {
    pub fn new(config: DecoderConfig, weights: DecoderWeights) -> Result<Self> {
        config.validate()?;
        weights.check(&config)?;
        Ok(TransformerDecoder { config, weights })
    }

    /// Build a decoder with freshly initialised weights.
    pub fn initialize<R: Rng + ?Sized>(config: DecoderConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let weights = DecoderWeights::initialize(&config, rng);
        Ok(TransformerDecoder { config, weights })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn weights(&self) -> &DecoderWeights {
        &self.weights
    }

    /// Full-sequence forward pass without caches.
    pub fn predict(&self, tokens: &TokenBatch, backend: &dyn ComputeBackend) -> Result<Tensor> {
        Ok(self.forward(DecoderInput::new(tokens), backend)?.logits)
    }

    /// Token embedding plus position embedding.
    ///
    /// Slot `i` of row `b` gets position `i`, or the index's `i`-th position
    /// for that row when an update index is given, so incremental steps are
    /// embedded at their absolute position.
    fn embed(&self, tokens: &TokenBatch, index: Option<&CacheUpdateIndex>) -> Result<Tensor> {
        let (batch, len) = (tokens.batch_size(), tokens.len());
        let dim = self.config.embedding_dim;
        let positions = index.map(|index| index.dense_positions(len));

        let mut data = Vec::with_capacity(batch * len * dim);
        for b in 0..batch {
            for (i, &id) in tokens.row(b).iter().enumerate() {
                let token = self.weights.token_embedding.row(id as usize).ok_or(
                    ModelError::TokenOutOfRange {
                        id,
                        vocab_size: self.config.vocabulary_size,
                    },
                )?;
                let position = positions
                    .as_ref()
                    .and_then(|p| p[b * len + i])
                    .unwrap_or(i);
                let pos = self.weights.position_embedding.row(position).ok_or(
                    ModelError::PositionOutOfRange {
                        position,
                        max: self.config.sequence_length,
                    },
                )?;
                data.extend(token.iter().zip(pos).map(|(t, p)| t + p));
            }
        }
        Ok(Tensor::try_new(data, Shape::new(vec![batch, len, dim]))?)
    }

    fn check_cache(&self, cache: &AttentionCache, batch: usize) -> Result<()> {
        let got = cache.tensor().shape().dims();
        let ok = cache.batch_size() == batch
            && cache.num_layers() == self.config.num_layers
            && cache.num_heads() == self.config.num_heads
            && cache.head_dim() == self.config.head_dim();
        if ok {
            Ok(())
        } else {
            Err(ModelError::CacheShapeMismatch {
                expected: vec![
                    batch,
                    self.config.num_layers,
                    2,
                    cache.max_length(),
                    self.config.num_heads,
                    self.config.head_dim(),
                ],
                got: got.to_vec(),
            })
        }
    }
}

impl DecoderModel for TransformerDecoder {
    fn forward(&self, input: DecoderInput<'_>, backend: &dyn ComputeBackend) -> Result<DecoderOutput> {
        let DecoderInput {
            tokens,
            self_cache,
            self_index,
            encoder_output,
            encoder_padding_mask,
            cross_cache,
            cross_index,
        } = input;

        let batch = tokens.batch_size();
        if batch == 0 || tokens.is_empty() {
            return Err(ModelError::Other("no tokens to process".to_string()));
        }
        match (self.config.cross_attention, encoder_output.is_some()) {
            (false, true) => return Err(ModelError::UnexpectedEncoderOutput),
            (true, false) => return Err(ModelError::MissingEncoderOutput),
            _ => {}
        }
        if cross_cache.is_some() && encoder_output.is_none() {
            return Err(ModelError::MissingEncoderOutput);
        }
        for cache in self_cache.iter().chain(cross_cache.iter()) {
            self.check_cache(cache, batch)?;
        }

        let mut hidden = self.embed(tokens, self_cache.as_ref().and(self_index))?;

        // Padding keys are only known when the keys are the input itself.
        let padding: Option<Vec<bool>> = (self.config.mask_zero && self_cache.is_none())
            .then(|| tokens.ids().iter().map(|&id| id != 0).collect());

        let mut self_layers = Vec::new();
        let mut cross_layers = Vec::new();
        for (i, layer) in self.weights.layers.iter().enumerate() {
            let layer_input = LayerInput {
                decoder_sequence: &hidden,
                encoder_sequence: encoder_output,
                decoder_padding_mask: padding.as_deref(),
                encoder_padding_mask,
                self_cache: self_cache.as_ref().map(|c| c.layer(i)).transpose()?,
                self_index,
                cross_cache: cross_cache.as_ref().map(|c| c.layer(i)).transpose()?,
                cross_index,
                use_causal_mask: self.config.use_causal_mask,
            };
            let out = layer.forward(layer_input, backend)?;
            hidden = out.hidden;
            self_layers.extend(out.self_cache);
            cross_layers.extend(out.cross_cache);
        }

        let self_cache = match self_cache {
            Some(_) => Some(AttentionCache::from_layers(&self_layers)?),
            None => None,
        };
        let cross_cache = match cross_cache {
            Some(_) => Some(AttentionCache::from_layers(&cross_layers)?),
            None => None,
        };

        Ok(DecoderOutput {
            logits: self.weights.output.forward(&hidden, backend)?,
            self_cache,
            cross_cache,
        })
    }

    fn sequence_length(&self) -> usize {
        self.config.sequence_length
    }

    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    fn head_dim(&self) -> usize {
        self.config.head_dim()
    }

    fn vocabulary_size(&self) -> usize {
        self.config.vocabulary_size
    }
}
