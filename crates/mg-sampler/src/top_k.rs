use rand::RngCore;

use crate::error::{Result, SamplerError};
use crate::policy::{check_temperature, sample_categorical, sort_descending, token_logits, SamplingPolicy};

/// Samples among the `k` highest-logit tokens only.
#[derive(Debug, Clone)]
pub struct TopKSampler {
    k: usize,
    temperature: f32,
}

impl TopKSampler {
    pub fn new(k: usize, temperature: f32) -> Result<Self> {
        if k == 0 {
            return Err(SamplerError::InvalidConfig("top-k needs k >= 1".to_string()));
        }
        check_temperature(temperature)?;
        Ok(Self { k, temperature })
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

impl SamplingPolicy for TopKSampler {
    fn name(&self) -> &str {
        "top_k"
    }

    fn select(&self, logits: &[f32], rng: &mut dyn RngCore) -> Result<u32> {
        let mut candidates = token_logits(logits);
        // Stable sort: among equal logits the lower id ranks first.
        sort_descending(&mut candidates);
        candidates.truncate(self.k);
        sample_categorical(&candidates, self.temperature, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_k_one_is_argmax_for_any_temperature() {
        let logits = [0.3, 2.5, -1.0, 2.4, 0.0];
        for temperature in [0.01, 1.0, 100.0] {
            let sampler = TopKSampler::new(1, temperature).unwrap();
            for seed in 0..10 {
                let mut rng = StdRng::seed_from_u64(seed);
                assert_eq!(sampler.select(&logits, &mut rng).unwrap(), 1);
            }
        }
    }

    #[test]
    fn test_only_top_k_ids_are_drawn() {
        let sampler = TopKSampler::new(2, 10.0).unwrap();
        let logits = [5.0, 0.0, 4.0, 0.1, 0.2];
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = [false; 5];
        for _ in 0..500 {
            seen[sampler.select(&logits, &mut rng).unwrap() as usize] = true;
        }
        assert_eq!(seen, [true, false, true, false, false]);
    }

    #[test]
    fn test_rejects_zero_k() {
        assert!(TopKSampler::new(0, 1.0).is_err());
    }

    #[test]
    fn test_k_larger_than_vocabulary() {
        let sampler = TopKSampler::new(10, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sampler.select(&[1.0, 1.0], &mut rng).unwrap() < 2);
    }
}
