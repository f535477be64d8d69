use rand::RngCore;

use crate::error::Result;
use crate::policy::{check_temperature, sample_categorical, token_logits, SamplingPolicy};

/// Samples from the full vocabulary after dividing logits by a temperature.
///
/// Higher temperatures produce more uniform distributions (more random),
/// while lower temperatures sharpen the distribution (more deterministic).
#[derive(Debug, Clone)]
pub struct TemperatureSampler {
    temperature: f32,
}

impl TemperatureSampler {
    pub fn new(temperature: f32) -> Result<Self> {
        check_temperature(temperature)?;
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }
}

impl SamplingPolicy for TemperatureSampler {
    fn name(&self) -> &str {
        "temperature"
    }

    fn select(&self, logits: &[f32], rng: &mut dyn RngCore) -> Result<u32> {
        sample_categorical(&token_logits(logits), self.temperature, rng)
    }
}
