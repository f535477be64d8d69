use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

use mg_model::{
    AttentionCache, CacheUpdateIndex, DecoderInput, DecoderModel, DecoderOutput, TokenBatch,
    Tokenizer,
};
use mg_tensor::{ComputeBackend, CpuBackend, Tensor};

use crate::config::SamplerConfig;
use crate::error::{Result, SamplerError};
use crate::policy::SamplingPolicy;

/// Result of one [`Sampler::sample`] call, one entry per prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutput {
    /// Detokenized prompt plus continuation, cut at the first end token.
    pub sequences: Vec<String>,
    /// Prompt ids (without the trailing end token) followed by every
    /// generated id, including any emitted after the row's first end token.
    pub token_ids: Vec<Vec<u32>>,
    /// Log-probability of each generated token, when requested.
    pub log_probs: Option<Vec<Vec<f32>>>,
    /// Entropy of each step's next-token distribution, when requested.
    pub entropies: Option<Vec<Vec<f32>>>,
    /// Per-row self-attention cache index after the last step.
    pub cache_index: Vec<usize>,
    /// Number of decode steps run.
    pub steps: usize,
    /// The cache bound stopped generation before every row had ended.
    pub truncated: bool,
}

/// Everything the generation loop carries from one step to the next.
#[derive(Debug, Clone)]
pub struct DecodeState<'e> {
    /// Last emitted (or last prompt) token of each row; the next step's input.
    pub last_tokens: Vec<u32>,
    pub self_cache: AttentionCache,
    /// One write position per row.
    pub self_index: CacheUpdateIndex,
    pub encoder_output: Option<&'e Tensor>,
    /// Primed once, then read without further writes.
    pub cross_cache: Option<AttentionCache>,
    /// Tokenized prompts, end token stripped.
    pub prompts: Vec<Vec<u32>>,
    pub generated: Vec<Vec<u32>>,
    pub log_probs: Option<Vec<Vec<f32>>>,
    pub entropies: Option<Vec<Vec<f32>>>,
    /// Whether each row has produced the end token, counting its seed token.
    pub finished: Vec<bool>,
    pub steps: usize,
    pub max_length: usize,
}

impl DecodeState<'_> {
    pub fn batch_size(&self) -> usize {
        self.last_tokens.len()
    }

    /// True once every row has produced the end token.
    pub fn is_finished(&self) -> bool {
        self.finished.iter().all(|&f| f)
    }

    /// True when another step would place a token at or past `max_length`.
    pub fn at_capacity(&self) -> bool {
        self.self_index
            .flat_positions()
            .iter()
            .any(|&p| p + 1 >= self.max_length)
    }

    pub fn open_rows(&self) -> usize {
        self.finished.iter().filter(|&&f| !f).count()
    }
}

/// Autoregressive generator: primes the decoder's cache with a batch of
/// prompts, then decodes one token per row per step with a
/// [`SamplingPolicy`] until every row has produced the end token.
///
/// The model and tokenizer are borrowed read-only; every call owns its own
/// caches and buffers, so one sampler can serve concurrent calls.
pub struct Sampler<'a> {
    model: &'a dyn DecoderModel,
    tokenizer: &'a dyn Tokenizer,
    policy: Box<dyn SamplingPolicy>,
    config: SamplerConfig,
    backend: CpuBackend,
    eos_token_id: u32,
}

impl<'a> Sampler<'a> {
    /// Build a sampler with the policy named in `config`.
    pub fn new(
        model: &'a dyn DecoderModel,
        tokenizer: &'a dyn Tokenizer,
        config: SamplerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.policy.build(config.temperature)?;
        Self::with_policy(model, tokenizer, config, policy)
    }

    /// Build a sampler around a caller-supplied policy. `config.policy` is
    /// ignored.
    pub fn with_policy(
        model: &'a dyn DecoderModel,
        tokenizer: &'a dyn Tokenizer,
        config: SamplerConfig,
        policy: Box<dyn SamplingPolicy>,
    ) -> Result<Self> {
        if tokenizer.bos_token_id().is_none() {
            return Err(SamplerError::MissingSpecialToken("begin"));
        }
        let eos_token_id = tokenizer
            .eos_token_id()
            .ok_or(SamplerError::MissingSpecialToken("end"))?;
        config.validate()?;
        if let Some(max_length) = config.max_length {
            if max_length > model.sequence_length() {
                return Err(SamplerError::InvalidConfig(format!(
                    "max_length {} exceeds the model's {} positions",
                    max_length,
                    model.sequence_length()
                )));
            }
        }
        Ok(Sampler {
            model,
            tokenizer,
            policy,
            backend: config.execution.backend(),
            config,
            eos_token_id,
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn policy(&self) -> &dyn SamplingPolicy {
        self.policy.as_ref()
    }

    /// Cache length used for each call.
    pub fn max_length(&self) -> usize {
        self.config.max_length.unwrap_or(self.model.sequence_length())
    }

    /// Generate continuations of `prompts`, seeding the RNG from the config.
    pub fn sample<S: AsRef<str>>(
        &self,
        prompts: &[S],
        encoder_output: Option<&Tensor>,
    ) -> Result<SampleOutput> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        self.sample_with_rng(prompts, encoder_output, &mut rng)
    }

    /// Only the generated strings.
    pub fn generate<S: AsRef<str>>(&self, prompts: &[S]) -> Result<Vec<String>> {
        Ok(self.sample(prompts, None)?.sequences)
    }

    pub fn sample_with_rng<S: AsRef<str>>(
        &self,
        prompts: &[S],
        encoder_output: Option<&Tensor>,
        rng: &mut dyn RngCore,
    ) -> Result<SampleOutput> {
        let prompts: Vec<&str> = prompts.iter().map(AsRef::as_ref).collect();
        let mut state = self.prime(&prompts, encoder_output)?;

        let mut truncated = false;
        while !state.is_finished() {
            if state.at_capacity() {
                warn!(
                    steps = state.steps,
                    max_length = state.max_length,
                    open_rows = state.open_rows(),
                    "generation truncated at cache length"
                );
                truncated = true;
                break;
            }
            state = self.step(state, rng)?;
        }
        info!(steps = state.steps, truncated, "generation stopped");

        self.finish(state, truncated)
    }

    /// Tokenize the prompts and run one forward pass over them to fill a
    /// fresh cache.
    ///
    /// Row `b` writes positions `0..len_b`. The returned state's index points
    /// at each row's last prompt position: the first step feeds that token
    /// again, at the same position, and so produces the first new token.
    pub fn prime<'e>(
        &self,
        prompts: &[&str],
        encoder_output: Option<&'e Tensor>,
    ) -> Result<DecodeState<'e>> {
        let batch = prompts.len();
        if batch == 0 {
            return Err(SamplerError::InvalidInput("no prompts to sample from".to_string()));
        }
        let encoder_len = match encoder_output {
            Some(encoder) => Some(check_encoder_output(encoder, batch)?),
            None => None,
        };

        let mut ragged = self.tokenizer.tokenize_ragged(prompts)?;
        for row in &mut ragged {
            if row.last() == Some(&self.eos_token_id) {
                row.pop();
            }
        }
        let lengths: Vec<usize> = ragged.iter().map(Vec::len).collect();
        let max_length = self.max_length();
        if let Some(b) = lengths.iter().position(|&len| len == 0 || len > max_length) {
            return Err(SamplerError::InvalidInput(format!(
                "prompt {} has {} tokens; need 1..={}",
                b, lengths[b], max_length
            )));
        }
        debug!(batch, ?lengths, max_length, "priming cache");

        let longest = lengths.iter().copied().max().unwrap_or(0);
        let tokens = self.tokenizer.pad(&ragged, Some(longest), None);
        let self_index = CacheUpdateIndex::range(&lengths);
        let cross_index = encoder_len.map(|len| CacheUpdateIndex::range(&vec![len; batch]));

        let mut input = DecoderInput::new(&tokens)
            .with_self_cache(self.model.initialize_attention_cache(batch, max_length), Some(&self_index));
        if let (Some(encoder), Some(len)) = (encoder_output, encoder_len) {
            input = input
                .with_encoder_output(encoder, None)
                .with_cross_cache(self.model.initialize_attention_cache(batch, len), cross_index.as_ref());
        }
        let primed = self.model.forward(input, self.backend())?;
        let (self_cache, cross_cache) = returned_caches(primed, encoder_output.is_some())?;

        let last_tokens: Vec<u32> = ragged.iter().filter_map(|row| row.last().copied()).collect();
        let finished = last_tokens.iter().map(|&t| t == self.eos_token_id).collect();
        let positions: Vec<usize> = lengths.iter().map(|&len| len - 1).collect();

        Ok(DecodeState {
            last_tokens,
            self_cache,
            self_index: CacheUpdateIndex::per_row(&positions),
            encoder_output,
            cross_cache,
            prompts: ragged,
            generated: vec![Vec::new(); batch],
            log_probs: self.config.return_log_probs.then(|| vec![Vec::new(); batch]),
            entropies: self.config.return_entropies.then(|| vec![Vec::new(); batch]),
            finished,
            steps: 0,
            max_length,
        })
    }

    /// Feed each row's last token, pick the next one, and advance the index.
    ///
    /// Rows that already ended keep stepping; their extra tokens are dropped
    /// when the output is detokenized.
    pub fn step<'e>(&self, state: DecodeState<'e>, rng: &mut dyn RngCore) -> Result<DecodeState<'e>> {
        let DecodeState {
            last_tokens,
            self_cache,
            mut self_index,
            encoder_output,
            cross_cache,
            prompts,
            mut generated,
            mut log_probs,
            mut entropies,
            mut finished,
            steps,
            max_length,
        } = state;
        let batch = last_tokens.len();
        debug!(
            step = steps,
            open_rows = finished.iter().filter(|&&f| !f).count(),
            "decode step"
        );

        let tokens = TokenBatch::new(last_tokens, batch, 1)?;
        let mut input = DecoderInput::new(&tokens).with_self_cache(self_cache, Some(&self_index));
        if let Some(encoder) = encoder_output {
            input = input.with_encoder_output(encoder, None);
        }
        if let Some(cache) = cross_cache {
            input = input.with_cross_cache(cache, None);
        }
        let output = self.model.forward(input, self.backend())?;
        let vocab = self.model.vocabulary_size();
        check_logits(&output, batch, vocab)?;

        let mut next_tokens = Vec::with_capacity(batch);
        for b in 0..batch {
            let logits = output
                .logits_at(b, 0)
                .ok_or_else(|| SamplerError::Decoder(format!("no step logits for row {}", b)))?;
            let token = self.policy.select(logits, rng)?;
            if token as usize >= vocab {
                return Err(SamplerError::Sampling(format!(
                    "policy {} chose token {} outside a vocabulary of {}",
                    self.policy.name(),
                    token,
                    vocab
                )));
            }
            next_tokens.push(token);
            generated[b].push(token);
            finished[b] |= token == self.eos_token_id;

            if log_probs.is_some() || entropies.is_some() {
                let log_softmax = self.backend().log_softmax(logits, vocab)?;
                if let Some(rows) = log_probs.as_mut() {
                    rows[b].push(log_softmax[token as usize]);
                }
                if let Some(rows) = entropies.as_mut() {
                    rows[b].push(entropy(&log_softmax));
                }
            }
        }
        self_index.advance();
        let (self_cache, cross_cache) = returned_caches(output, encoder_output.is_some())?;

        Ok(DecodeState {
            last_tokens: next_tokens,
            self_cache,
            self_index,
            encoder_output,
            cross_cache,
            prompts,
            generated,
            log_probs,
            entropies,
            finished,
            steps: steps + 1,
            max_length,
        })
    }

    /// Join prompts with their continuations and detokenize.
    fn finish(&self, state: DecodeState<'_>, truncated: bool) -> Result<SampleOutput> {
        let token_ids: Vec<Vec<u32>> = state
            .prompts
            .into_iter()
            .zip(state.generated)
            .map(|(mut prompt, generated)| {
                prompt.extend(generated);
                prompt
            })
            .collect();
        let sequences = self.tokenizer.detokenize_batch(&token_ids)?;
        Ok(SampleOutput {
            sequences,
            token_ids,
            log_probs: state.log_probs,
            entropies: state.entropies,
            cache_index: state.self_index.flat_positions().to_vec(),
            steps: state.steps,
            truncated,
        })
    }

    fn backend(&self) -> &dyn ComputeBackend {
        &self.backend
    }
}

/// `-sum(p * log p)`, where zero-probability terms contribute nothing.
pub fn entropy(log_probs: &[f32]) -> f32 {
    -log_probs
        .iter()
        .map(|&lp| {
            let p = lp.exp();
            if p == 0.0 {
                0.0
            } else {
                p * lp
            }
        })
        .sum::<f32>()
}

/// Encoder output must be `[batch, encoder_len, hidden]`; returns `encoder_len`.
fn check_encoder_output(encoder: &Tensor, batch: usize) -> Result<usize> {
    let dims = encoder.shape().dims();
    if dims.len() != 3 || dims[0] != batch || dims[1] == 0 {
        return Err(SamplerError::InvalidInput(format!(
            "encoder output must be [{}, encoder_len > 0, hidden], got {}",
            batch,
            encoder.shape()
        )));
    }
    Ok(dims[1])
}

fn check_logits(output: &DecoderOutput, batch: usize, vocab: usize) -> Result<()> {
    let dims = output.logits.shape().dims();
    if dims != [batch, 1, vocab] {
        return Err(SamplerError::Decoder(format!(
            "expected step logits [{}, 1, {}], got {}",
            batch,
            vocab,
            output.logits.shape()
        )));
    }
    Ok(())
}

/// The caches a decoder call must hand back: always the self cache, and the
/// cross cache when an encoder output was supplied.
fn returned_caches(
    output: DecoderOutput,
    with_cross: bool,
) -> Result<(AttentionCache, Option<AttentionCache>)> {
    let self_cache = output
        .self_cache
        .ok_or_else(|| SamplerError::Decoder("self-attention cache was not returned".to_string()))?;
    let cross_cache = match (with_cross, output.cross_cache) {
        (true, Some(cache)) => Some(cache),
        (true, None) => {
            return Err(SamplerError::Decoder(
                "cross-attention cache was not returned".to_string(),
            ))
        }
        (false, _) => None,
    };
    Ok((self_cache, cross_cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_entropy_of_uniform() {
        let lp = (0.25f32).ln();
        assert_abs_diff_eq!(entropy(&[lp; 4]), (4.0f32).ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_entropy_ignores_zero_probability_terms() {
        let value = entropy(&[0.0, f32::NEG_INFINITY, -1e9]);
        assert!(value.is_finite());
        assert_abs_diff_eq!(value, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_encoder_output_shape_is_checked() {
        let ok = Tensor::zeros(mg_tensor::Shape::new(vec![2, 3, 4]));
        assert_eq!(check_encoder_output(&ok, 2).unwrap(), 3);
        assert!(check_encoder_output(&ok, 1).is_err());
        let flat = Tensor::zeros(mg_tensor::Shape::new(vec![2, 12]));
        assert!(check_encoder_output(&flat, 2).is_err());
    }
}
