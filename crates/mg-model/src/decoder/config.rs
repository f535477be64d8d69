use serde::{Deserialize, Serialize};

use mg_tensor::Activation;

use crate::error::{ModelError, Result};

/// Activation used by the first feed-forward dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    #[default]
    Relu,
    Gelu,
    Linear,
}

impl From<ActivationKind> for Activation {
    fn from(kind: ActivationKind) -> Self {
        match kind {
            ActivationKind::Relu => Activation::Relu,
            ActivationKind::Gelu => Activation::Gelu,
            ActivationKind::Linear => Activation::Linear,
        }
    }
}

/// Hyperparameters of a [`TransformerDecoder`](super::TransformerDecoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Number of stacked decoder layers.
    pub num_layers: usize,
    /// Number of attention heads per attention block.
    pub num_heads: usize,
    /// Hidden size; must be divisible by `num_heads`.
    pub embedding_dim: usize,
    /// Width of the feed-forward intermediate layer.
    pub intermediate_dim: usize,
    /// Number of output logits / token embedding rows.
    pub vocabulary_size: usize,
    /// Number of learned positions (the longest decodable sequence).
    pub sequence_length: usize,
    pub layer_norm_epsilon: f32,
    pub activation: ActivationKind,
    /// Pre-norm (`true`) or post-norm (`false`) residual wiring.
    pub normalize_first: bool,
    /// Treat token id 0 as padding when building the key mask.
    pub mask_zero: bool,
    pub use_causal_mask: bool,
    /// Build a cross-attention block in every layer.
    pub cross_attention: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            num_layers: 2,
            num_heads: 4,
            embedding_dim: 128,
            intermediate_dim: 512,
            vocabulary_size: 64,
            sequence_length: 128,
            layer_norm_epsilon: 1e-5,
            activation: ActivationKind::Relu,
            normalize_first: false,
            mask_zero: true,
            use_causal_mask: true,
            cross_attention: false,
        }
    }
}

impl DecoderConfig {
    /// Parse a configuration from JSON. Missing keys take their defaults.
    pub fn from_json_str(content: &str) -> Result<DecoderConfig> {
        let config: DecoderConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Dimension of each attention head (embedding_dim / num_heads).
    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("embedding_dim", self.embedding_dim),
            ("intermediate_dim", self.intermediate_dim),
            ("vocabulary_size", self.vocabulary_size),
            ("sequence_length", self.sequence_length),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        if self.embedding_dim % self.num_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "embedding_dim {} is not divisible by num_heads {}",
                self.embedding_dim, self.num_heads
            )));
        }
        if !(self.layer_norm_epsilon.is_finite() && self.layer_norm_epsilon > 0.0) {
            return Err(ModelError::InvalidConfig(
                "layer_norm_epsilon must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
