use rand::RngCore;

use crate::error::{Result, SamplerError};
use crate::policy::SamplingPolicy;

/// Greedy sampler: selects the single token with the highest logit.
///
/// Ties go to the lowest id. The RNG is never touched.
#[derive(Debug, Clone, Default)]
pub struct GreedySampler;

impl GreedySampler {
    pub fn new() -> Self {
        Self
    }
}

impl SamplingPolicy for GreedySampler {
    fn name(&self) -> &str {
        "greedy"
    }

    fn select(&self, logits: &[f32], _rng: &mut dyn RngCore) -> Result<u32> {
        let mut best: Option<(usize, f32)> = None;
        for (i, &logit) in logits.iter().enumerate() {
            if logit.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, b)| logit > b) {
                best = Some((i, logit));
            }
        }
        best.map(|(i, _)| i as u32)
            .ok_or_else(|| SamplerError::Sampling("no finite logits to choose from".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_picks_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(GreedySampler::new().select(&[0.1, 3.0, 2.9], &mut rng).unwrap(), 1);
    }

    #[test]
    fn test_ties_go_to_lowest_id() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(GreedySampler::new().select(&[1.0, 4.0, 4.0], &mut rng).unwrap(), 1);
    }

    #[test]
    fn test_empty_logits_fail() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(GreedySampler::new().select(&[], &mut rng).is_err());
    }
}
