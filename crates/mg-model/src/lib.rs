pub mod architecture;
pub mod decoder;
pub mod error;
pub mod tokenizer;

pub use architecture::DecoderModel;
pub use decoder::{
    AttentionCache, AttentionMask, CacheUpdateIndex, CachedMultiHeadAttention, DecoderConfig,
    DecoderInput, DecoderLayer, DecoderOutput, DecoderWeights, LayerCache, TransformerDecoder,
};
pub use error::{ModelError, Result};
pub use tokenizer::{
    PaddingMode, SmilesTokenizer, TokenBatch, Tokenizer, TokenizerConfig, Vocabulary,
};
