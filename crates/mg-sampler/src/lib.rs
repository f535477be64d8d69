//! Autoregressive generation: pluggable next-token policies and the
//! cache-primed decode loop.

pub mod config;
pub mod error;
pub mod greedy;
pub mod policy;
pub mod sampler;
pub mod temperature;
pub mod top_k;
pub mod top_p;

pub use config::{ExecutionMode, PolicyConfig, SamplerConfig};
pub use error::{Result, SamplerError};
pub use greedy::GreedySampler;
pub use policy::{token_logits, SamplingPolicy, TokenLogit};
pub use sampler::{entropy, DecodeState, SampleOutput, Sampler};
pub use temperature::TemperatureSampler;
pub use top_k::TopKSampler;
pub use top_p::TopPSampler;
