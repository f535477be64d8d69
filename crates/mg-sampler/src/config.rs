use serde::{Deserialize, Serialize};

use mg_tensor::CpuBackend;

use crate::error::{Result, SamplerError};
use crate::greedy::GreedySampler;
use crate::policy::SamplingPolicy;
use crate::temperature::TemperatureSampler;
use crate::top_k::TopKSampler;
use crate::top_p::TopPSampler;

/// How the numeric kernels run. Both modes produce identical tokens for the
/// same seed; only throughput differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn backend(self) -> CpuBackend {
        match self {
            ExecutionMode::Sequential => CpuBackend::new(),
            ExecutionMode::Parallel => CpuBackend::parallel(),
        }
    }
}

/// Next-token selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Sample from the full temperature-scaled distribution.
    #[default]
    Temperature,
    TopK {
        #[serde(default = "default_top_k")]
        k: usize,
    },
    Greedy,
    TopP { p: f32 },
}

fn default_top_k() -> usize {
    5
}

impl PolicyConfig {
    pub fn build(&self, temperature: f32) -> Result<Box<dyn SamplingPolicy>> {
        let policy: Box<dyn SamplingPolicy> = match *self {
            PolicyConfig::Temperature => Box::new(TemperatureSampler::new(temperature)?),
            PolicyConfig::TopK { k } => Box::new(TopKSampler::new(k, temperature)?),
            PolicyConfig::Greedy => Box::new(GreedySampler::new()),
            PolicyConfig::TopP { p } => Box::new(TopPSampler::new(p, temperature)?),
        };
        Ok(policy)
    }
}

/// Generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub policy: PolicyConfig,
    /// Logits are divided by this before sampling; must be > 0.
    pub temperature: f32,
    /// Seed of the RNG behind [`Sampler::sample`](crate::Sampler::sample).
    pub seed: u64,
    pub return_log_probs: bool,
    pub return_entropies: bool,
    pub execution: ExecutionMode,
    /// Cache length. Defaults to the model's sequence length and bounds the
    /// prompt plus generated tokens.
    pub max_length: Option<usize>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            policy: PolicyConfig::Temperature,
            temperature: 1.0,
            seed: 0,
            return_log_probs: false,
            return_entropies: false,
            execution: ExecutionMode::Sequential,
            max_length: None,
        }
    }
}

impl SamplerConfig {
    /// Parse a configuration from JSON. Missing keys take their defaults.
    pub fn from_json_str(content: &str) -> Result<SamplerConfig> {
        let config: SamplerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "temperature must be a positive number, got {}",
                self.temperature
            )));
        }
        if self.max_length == Some(0) {
            return Err(SamplerError::InvalidConfig("max_length must be > 0".to_string()));
        }
        self.policy.build(self.temperature).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SamplerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.policy, PolicyConfig::Temperature);
        assert!(!config.execution.backend().is_parallel());
    }

    #[test]
    fn test_from_json() {
        let config = SamplerConfig::from_json_str(
            r#"{"policy": {"type": "top_k", "k": 5}, "temperature": 0.7,
                "seed": 42, "execution": "parallel", "return_entropies": true}"#,
        )
        .unwrap();
        assert_eq!(config.policy, PolicyConfig::TopK { k: 5 });
        assert_eq!(config.seed, 42);
        assert!(config.return_entropies);
        assert!(config.execution.backend().is_parallel());
    }

    #[test]
    fn test_top_k_defaults_to_five() {
        let config = SamplerConfig::from_json_str(r#"{"policy": {"type": "top_k"}}"#).unwrap();
        assert_eq!(config.policy, PolicyConfig::TopK { k: 5 });
        assert_eq!(config.temperature, 1.0);
    }

    #[test]
    fn test_rejects_bad_values() {
        for json in [
            r#"{"temperature": 0.0}"#,
            r#"{"temperature": -1.0}"#,
            r#"{"policy": {"type": "top_k", "k": 0}}"#,
            r#"{"policy": {"type": "top_p", "p": 1.5}}"#,
            r#"{"max_length": 0}"#,
        ] {
            assert!(SamplerConfig::from_json_str(json).is_err(), "{}", json);
        }
    }
}
