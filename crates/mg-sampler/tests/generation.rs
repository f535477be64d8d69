use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use mg_model::{
    DecoderConfig, DecoderInput, DecoderModel, DecoderOutput, ModelError, SmilesTokenizer,
    TokenizerConfig, TransformerDecoder,
};
use mg_sampler::{
    ExecutionMode, PolicyConfig, Sampler, SamplerConfig, SamplerError, SamplingPolicy,
};
use mg_tensor::{ComputeBackend, Shape, Tensor};

const BOS: u32 = 2;
const EOS: u32 = 3;
const A: u32 = 4;
const B: u32 = 5;

/// Decoder whose next token is a fixed function of the current input token.
struct ScriptedDecoder {
    vocab: usize,
    sequence_length: usize,
    script: HashMap<u32, u32>,
    fallback: u32,
}

impl ScriptedDecoder {
    fn new(script: &[(u32, u32)], fallback: u32) -> Self {
        ScriptedDecoder {
            vocab: 6,
            sequence_length: 16,
            script: script.iter().copied().collect(),
            fallback,
        }
    }
}

impl DecoderModel for ScriptedDecoder {
    fn forward(
        &self,
        input: DecoderInput<'_>,
        _backend: &dyn ComputeBackend,
    ) -> mg_model::Result<DecoderOutput> {
        let tokens = input.tokens;
        let mut logits = Vec::with_capacity(tokens.ids().len() * self.vocab);
        for &id in tokens.ids() {
            let next = self.script.get(&id).copied().unwrap_or(self.fallback);
            logits.extend((0..self.vocab as u32).map(|v| if v == next { 0.0 } else { -1e9 }));
        }
        Ok(DecoderOutput {
            logits: Tensor::new(
                logits,
                Shape::new(vec![tokens.batch_size(), tokens.len(), self.vocab]),
            ),
            self_cache: input.self_cache,
            cross_cache: input.cross_cache,
        })
    }

    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn num_layers(&self) -> usize {
        1
    }

    fn num_heads(&self) -> usize {
        1
    }

    fn head_dim(&self) -> usize {
        2
    }

    fn vocabulary_size(&self) -> usize {
        self.vocab
    }
}

fn ab_tokenizer() -> SmilesTokenizer {
    SmilesTokenizer::with_vocabulary(
        TokenizerConfig {
            add_bos: true,
            add_eos: true,
            oov_token: "[unk]".to_string(),
            ..TokenizerConfig::default()
        },
        &["A", "B"],
    )
    .unwrap()
}

#[test]
fn test_scripted_generation_emits_b_then_stops() {
    let model = ScriptedDecoder::new(&[(A, B), (B, EOS)], EOS);
    let tokenizer = ab_tokenizer();
    let sampler = Sampler::new(&model, &tokenizer, SamplerConfig::default()).unwrap();

    let out = sampler.sample(&["A"], None).unwrap();
    assert_eq!(out.sequences, vec!["AB"]);
    assert_eq!(out.token_ids, vec![vec![BOS, A, B, EOS]]);
    assert_eq!(out.steps, 2);
    assert_eq!(out.cache_index, vec![3]);
    assert!(!out.truncated);
    assert!(out.log_probs.is_none());
    assert!(out.entropies.is_none());
}

#[test]
fn test_log_probs_and_entropies_per_step() {
    let model = ScriptedDecoder::new(&[(A, B), (B, EOS)], EOS);
    let tokenizer = ab_tokenizer();
    let config = SamplerConfig {
        return_log_probs: true,
        return_entropies: true,
        ..SamplerConfig::default()
    };
    let out = Sampler::new(&model, &tokenizer, config)
        .unwrap()
        .sample(&["A", "B"], None)
        .unwrap();

    let log_probs = out.log_probs.unwrap();
    let entropies = out.entropies.unwrap();
    for row in 0..2 {
        assert_eq!(log_probs[row].len(), out.steps);
        assert_eq!(entropies[row].len(), out.steps);
        assert!(log_probs[row].iter().all(|lp| lp.abs() < 1e-5));
        assert!(entropies[row].iter().all(|h| h.is_finite() && h.abs() < 1e-5));
    }
}

#[test]
fn test_finished_rows_keep_stepping_but_output_is_cut() {
    // Row 0 ends after one step; row 1 needs two. Row 0's step after its
    // end token is discarded by detokenization.
    let model = ScriptedDecoder::new(&[(A, B), (B, EOS), (EOS, A)], EOS);
    let tokenizer = ab_tokenizer();
    let sampler = Sampler::new(&model, &tokenizer, SamplerConfig::default()).unwrap();

    let out = sampler.sample(&["B", "A"], None).unwrap();
    assert_eq!(out.steps, 2);
    assert_eq!(out.token_ids[0], vec![BOS, B, EOS, A]);
    assert_eq!(out.sequences, vec!["B", "AB"]);
    assert_eq!(out.cache_index, vec![3, 3]);
}

#[test]
fn test_prompts_already_ended_run_no_steps() {
    let model = ScriptedDecoder::new(&[], A);
    let tokenizer = ab_tokenizer();
    let sampler = Sampler::new(&model, &tokenizer, SamplerConfig::default()).unwrap();

    let out = sampler.sample(&["A[eos]", "BA[eos]"], None).unwrap();
    assert_eq!(out.steps, 0);
    assert_eq!(out.sequences, vec!["A", "BA"]);
    assert_eq!(out.cache_index, vec![2, 3]);
}

#[test]
fn test_generation_is_truncated_at_cache_length() {
    // Never emits the end token.
    let model = ScriptedDecoder::new(&[], A);
    let tokenizer = ab_tokenizer();
    let config = SamplerConfig {
        max_length: Some(5),
        ..SamplerConfig::default()
    };
    let out = Sampler::new(&model, &tokenizer, config)
        .unwrap()
        .sample(&["B"], None)
        .unwrap();
    assert!(out.truncated);
    assert_eq!(out.steps, 3);
    assert_eq!(out.token_ids[0].len(), 5);
    assert_eq!(out.sequences, vec!["BAAA"]);
}

#[test]
fn test_requires_begin_and_end_tokens() {
    let model = ScriptedDecoder::new(&[], EOS);
    let no_bos = SmilesTokenizer::with_vocabulary(
        TokenizerConfig {
            add_eos: true,
            ..TokenizerConfig::default()
        },
        &["A"],
    )
    .unwrap();
    assert!(matches!(
        Sampler::new(&model, &no_bos, SamplerConfig::default()),
        Err(SamplerError::MissingSpecialToken("begin"))
    ));

    let no_eos = SmilesTokenizer::with_vocabulary(
        TokenizerConfig {
            add_bos: true,
            ..TokenizerConfig::default()
        },
        &["A"],
    )
    .unwrap();
    assert!(matches!(
        Sampler::new(&model, &no_eos, SamplerConfig::default()),
        Err(SamplerError::MissingSpecialToken("end"))
    ));
}

#[test]
fn test_rejects_bad_inputs_before_decoding() {
    let model = ScriptedDecoder::new(&[], EOS);
    let tokenizer = ab_tokenizer();
    let sampler = Sampler::new(&model, &tokenizer, SamplerConfig::default()).unwrap();

    let empty: [&str; 0] = [];
    assert!(matches!(sampler.sample(&empty, None), Err(SamplerError::InvalidInput(_))));

    let encoder = Tensor::zeros(Shape::new(vec![2, 3, 4]));
    assert!(matches!(
        sampler.sample(&["A"], Some(&encoder)),
        Err(SamplerError::InvalidInput(_))
    ));

    let too_long = SamplerConfig {
        max_length: Some(64),
        ..SamplerConfig::default()
    };
    assert!(matches!(
        Sampler::new(&model, &tokenizer, too_long),
        Err(SamplerError::InvalidConfig(_))
    ));
}

/// Always answers with the end token.
#[derive(Debug)]
struct StopImmediately;

impl SamplingPolicy for StopImmediately {
    fn name(&self) -> &str {
        "stop"
    }

    fn select(&self, _logits: &[f32], _rng: &mut dyn RngCore) -> mg_sampler::Result<u32> {
        Ok(EOS)
    }
}

#[test]
fn test_custom_policy_drives_the_loop() {
    let model = ScriptedDecoder::new(&[], A);
    let tokenizer = ab_tokenizer();
    let sampler = Sampler::with_policy(
        &model,
        &tokenizer,
        SamplerConfig::default(),
        Box::new(StopImmediately),
    )
    .unwrap();
    assert_eq!(sampler.policy().name(), "stop");
    let out = sampler.sample(&["AB"], None).unwrap();
    assert_eq!(out.steps, 1);
    assert_eq!(out.sequences, vec!["AB"]);
}

fn smiles_tokenizer() -> SmilesTokenizer {
    SmilesTokenizer::with_vocabulary(
        TokenizerConfig {
            add_bos: true,
            add_eos: true,
            ..TokenizerConfig::default()
        },
        &["C", "c", "O", "N", "(", ")", "=", "1"],
    )
    .unwrap()
}

fn real_model(cross_attention: bool) -> TransformerDecoder {
    let config = DecoderConfig {
        num_layers: 2,
        num_heads: 2,
        embedding_dim: 8,
        intermediate_dim: 16,
        vocabulary_size: 12,
        sequence_length: 12,
        cross_attention,
        ..DecoderConfig::default()
    };
    TransformerDecoder::initialize(config, &mut StdRng::seed_from_u64(21)).unwrap()
}

#[test]
fn test_same_seed_same_molecules() {
    let model = real_model(false);
    let tokenizer = smiles_tokenizer();
    let config = SamplerConfig {
        seed: 1234,
        return_log_probs: true,
        ..SamplerConfig::default()
    };
    let first = Sampler::new(&model, &tokenizer, config.clone())
        .unwrap()
        .sample(&["C", "CO", "c1"], None)
        .unwrap();
    let second = Sampler::new(&model, &tokenizer, config.clone())
        .unwrap()
        .sample(&["C", "CO", "c1"], None)
        .unwrap();
    assert_eq!(first, second);

    let parallel = SamplerConfig {
        execution: ExecutionMode::Parallel,
        ..config
    };
    let third = Sampler::new(&model, &tokenizer, parallel)
        .unwrap()
        .sample(&["C", "CO", "c1"], None)
        .unwrap();
    assert_eq!(first, third);

    // Every row ends or the whole batch hits the cache bound.
    assert!(first.truncated || first.token_ids.iter().all(|row| row.contains(&EOS)));
    assert!(first.token_ids.iter().all(|row| row.len() <= 12));
}

#[test]
fn test_top_k_one_matches_greedy() {
    let model = real_model(false);
    let tokenizer = smiles_tokenizer();
    let run = |policy, temperature, seed| {
        let config = SamplerConfig {
            policy,
            temperature,
            seed,
            ..SamplerConfig::default()
        };
        Sampler::new(&model, &tokenizer, config)
            .unwrap()
            .sample(&["CC", "N"], None)
            .unwrap()
            .token_ids
    };
    let greedy = run(PolicyConfig::Greedy, 1.0, 0);
    assert_eq!(run(PolicyConfig::TopK { k: 1 }, 0.3, 5), greedy);
    assert_eq!(run(PolicyConfig::TopK { k: 1 }, 3.0, 99), greedy);
}

#[test]
fn test_cross_attention_generation() {
    let model = real_model(true);
    let tokenizer = smiles_tokenizer();
    let sampler = Sampler::new(&model, &tokenizer, SamplerConfig::default()).unwrap();
    let encoder = Tensor::from_fn(Shape::new(vec![2, 3, 8]), |i| (i as f32 * 0.1).sin());

    let out = sampler.sample(&["C", "O"], Some(&encoder)).unwrap();
    assert_eq!(out.sequences.len(), 2);
    assert_eq!(out.cache_index.len(), 2);

    assert!(matches!(
        sampler.sample(&["C", "O"], None),
        Err(SamplerError::Model(ModelError::MissingEncoderOutput))
    ));

    let self_only = real_model(false);
    let sampler = Sampler::new(&self_only, &tokenizer, SamplerConfig::default()).unwrap();
    assert!(matches!(
        sampler.sample(&["C", "O"], Some(&encoder)),
        Err(SamplerError::Model(ModelError::UnexpectedEncoderOutput))
    ));
}
