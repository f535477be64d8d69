use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("tokenizer error: {0}")]
    TokenizerError(String),
    #[error("regex error: {0}")]
    Regex(#[from] Box<fancy_regex::Error>),
    #[error("encoder output supplied to a decoder built without cross attention")]
    UnexpectedEncoderOutput,
    #[error("decoder has cross attention but no encoder output was supplied")]
    MissingEncoderOutput,
    #[error("position {position} exceeds position embedding length {max}")]
    PositionOutOfRange { position: usize, max: usize },
    #[error("token id {id} exceeds vocab size {vocab_size}")]
    TokenOutOfRange { id: u32, vocab_size: usize },
    #[error("cache shape mismatch: expected {expected:?}, got {got:?}")]
    CacheShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("tensor error: {0}")]
    TensorError(#[from] mg_tensor::TensorError),
    #[error("{0}")]
    Other(String),
}

impl From<fancy_regex::Error> for ModelError {
    fn from(err: fancy_regex::Error) -> Self {
        ModelError::Regex(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
