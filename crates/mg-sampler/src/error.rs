use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("tokenizer has no {0} token; enable add_bos and add_eos for generation")]
    MissingSpecialToken(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error("decoder broke its contract: {0}")]
    Decoder(String),
    #[error("model error: {0}")]
    Model(#[from] mg_model::ModelError),
    #[error("tensor error: {0}")]
    Tensor(#[from] mg_tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, SamplerError>;
