use std::fmt::Debug;

use rand::distributions::{Distribution, WeightedIndex};
use rand::RngCore;

use crate::error::{Result, SamplerError};

/// A token ID paired with its logit value.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLogit {
    pub token_id: u32,
    pub logit: f32,
}

/// Pair every logit with its vocabulary id.
pub fn token_logits(logits: &[f32]) -> Vec<TokenLogit> {
    logits
        .iter()
        .enumerate()
        .map(|(i, &logit)| TokenLogit {
            token_id: i as u32,
            logit,
        })
        .collect()
}

/// Next-token selection strategy: one row of logits in, one token id out.
///
/// The generation loop only sees this trait, so new strategies plug in
/// without touching it.
pub trait SamplingPolicy: Send + Sync + Debug {
    /// Returns the name of this policy.
    fn name(&self) -> &str;

    /// Choose the next token from unnormalised `logits` over the vocabulary.
    fn select(&self, logits: &[f32], rng: &mut dyn RngCore) -> Result<u32>;
}

/// Sort descending by logit value.
pub(crate) fn sort_descending(logits: &mut [TokenLogit]) {
    logits.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
}

pub(crate) fn check_temperature(temperature: f32) -> Result<()> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(SamplerError::InvalidConfig(format!(
            "temperature must be a positive number, got {}",
            temperature
        )))
    }
}

/// Softmax probabilities of the candidates' logits divided by `temperature`.
pub(crate) fn probabilities(candidates: &[TokenLogit], temperature: f32) -> Vec<f32> {
    let max_logit = candidates
        .iter()
        .map(|t| t.logit / temperature)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates
        .iter()
        .map(|t| (t.logit / temperature - max_logit).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Draw one candidate from the temperature-scaled categorical distribution
/// and return its vocabulary id.
pub(crate) fn sample_categorical(
    candidates: &[TokenLogit],
    temperature: f32,
    rng: &mut dyn RngCore,
) -> Result<u32> {
    match candidates {
        [] => Err(SamplerError::Sampling("no candidate tokens".to_string())),
        [only] => Ok(only.token_id),
        _ => {
            let probs = probabilities(candidates, temperature);
            let dist = WeightedIndex::new(&probs)
                .map_err(|e| SamplerError::Sampling(format!("invalid distribution: {}", e)))?;
            Ok(candidates[dist.sample(rng)].token_id)
        }
    }
}
