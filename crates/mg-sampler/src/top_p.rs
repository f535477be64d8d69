use rand::RngCore;

use crate::error::{Result, SamplerError};
use crate::policy::{
    check_temperature, probabilities, sample_categorical, sort_descending, token_logits,
    SamplingPolicy,
};

/// Nucleus sampling: keeps the smallest set of tokens whose cumulative
/// probability exceeds the threshold `p`, then samples among them.
#[derive(Debug, Clone)]
pub struct TopPSampler {
    p: f32,
    temperature: f32,
}

impl TopPSampler {
    pub fn new(p: f32, temperature: f32) -> Result<Self> {
        if !(p > 0.0 && p <= 1.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "top-p threshold must lie in (0, 1], got {}",
                p
            )));
        }
        check_temperature(temperature)?;
        Ok(Self { p, temperature })
    }

    pub fn p(&self) -> f32 {
        self.p
    }
}

impl SamplingPolicy for TopPSampler {
    fn name(&self) -> &str {
        "top_p"
    }

    fn select(&self, logits: &[f32], rng: &mut dyn RngCore) -> Result<u32> {
        let mut candidates = token_logits(logits);
        sort_descending(&mut candidates);
        let probs = probabilities(&candidates, self.temperature);

        // Keep tokens until cumulative probability exceeds p.
        let mut cumulative = 0.0f32;
        let mut cutoff = candidates.len();
        for (i, &prob) in probs.iter().enumerate() {
            cumulative += prob;
            if cumulative > self.p {
                cutoff = i + 1;
                break;
            }
        }
        candidates.truncate(cutoff.max(1));
        sample_categorical(&candidates, self.temperature, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dominant_token_is_the_whole_nucleus() {
        let sampler = TopPSampler::new(0.5, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..50 {
            assert_eq!(sampler.select(&[0.0, 5.0, 0.0], &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_tail_is_excluded() {
        // probs ~ [0.49, 0.49, 0.02]; p = 0.9 keeps the first two.
        let sampler = TopPSampler::new(0.9, 1.0).unwrap();
        let logits = [3.0, 3.0, -0.2];
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..300 {
            assert_ne!(sampler.select(&logits, &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn test_rejects_bad_threshold() {
        assert!(TopPSampler::new(0.0, 1.0).is_err());
        assert!(TopPSampler::new(1.01, 1.0).is_err());
        assert!(TopPSampler::new(1.0, 1.0).is_ok());
    }
}
