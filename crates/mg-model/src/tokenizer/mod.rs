pub mod smiles;
pub mod vocab;

pub use smiles::SmilesTokenizer;
pub use vocab::Vocabulary;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

pub const PAD_TOKEN: &str = "[pad]";
pub const OOV_TOKEN: &str = "[oov]";
pub const BOS_TOKEN: &str = "[bos]";
pub const EOS_TOKEN: &str = "[eos]";
pub const SEP_TOKEN: &str = "[sep]";

pub const PAD_TOKEN_ID: u32 = 0;
pub const OOV_TOKEN_ID: u32 = 1;

/// Which side of a sequence receives padding (and loses tokens on truncation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingMode {
    #[default]
    Right,
    Left,
}

/// Tokenizer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Length of dense token batches. `None` pads to the longest sequence.
    pub sequence_length: Option<usize>,
    pub add_bos: bool,
    pub add_eos: bool,
    pub oov_token: String,
    /// Separator between reactants and product in reaction strings.
    pub sep_token: Option<String>,
    pub padding_mode: PaddingMode,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        TokenizerConfig {
            sequence_length: None,
            add_bos: false,
            add_eos: false,
            oov_token: OOV_TOKEN.to_string(),
            sep_token: None,
            padding_mode: PaddingMode::Right,
        }
    }
}

impl TokenizerConfig {
    /// Parse a configuration from JSON. Missing keys take their defaults.
    pub fn from_json_str(content: &str) -> Result<TokenizerConfig> {
        let config: TokenizerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.oov_token.is_empty() {
            return Err(ModelError::InvalidConfig("oov_token must not be empty".to_string()));
        }
        if self.sequence_length == Some(0) {
            return Err(ModelError::InvalidConfig("sequence_length must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn bos_token(&self) -> Option<&str> {
        self.add_bos.then_some(BOS_TOKEN)
    }

    pub fn eos_token(&self) -> Option<&str> {
        self.add_eos.then_some(EOS_TOKEN)
    }

    /// Reserved tokens in id order: pad, oov, then bos and eos when enabled.
    pub fn special_tokens(&self) -> Vec<String> {
        let mut tokens = vec![PAD_TOKEN.to_string(), self.oov_token.clone()];
        tokens.extend(self.bos_token().map(str::to_string));
        tokens.extend(self.eos_token().map(str::to_string));
        tokens
    }

    /// `[bos]` is id 2 when enabled.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.add_bos.then_some(2)
    }

    /// `[eos]` follows `[bos]`, or takes id 2 when there is no `[bos]`.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.add_eos.then_some(if self.add_bos { 3 } else { 2 })
    }
}

/// Dense `[batch, len]` grid of token ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    ids: Vec<u32>,
    batch: usize,
    len: usize,
}

impl TokenBatch {
    pub fn new(ids: Vec<u32>, batch: usize, len: usize) -> Result<Self> {
        if ids.len() != batch * len {
            return Err(ModelError::TokenizerError(format!(
                "{} token ids do not fill a {}x{} batch",
                ids.len(),
                batch,
                len
            )));
        }
        Ok(TokenBatch { ids, batch, len })
    }

    /// Pad or truncate every row to `len`. Left mode pads at the front and
    /// keeps the last `len` tokens of long rows.
    pub fn from_rows(rows: &[Vec<u32>], len: usize, pad_value: u32, mode: PaddingMode) -> Self {
        let mut ids = Vec::with_capacity(rows.len() * len);
        for row in rows {
            let kept = row.len().min(len);
            let padding = std::iter::repeat(pad_value).take(len - kept);
            match mode {
                PaddingMode::Right => {
                    ids.extend_from_slice(&row[..kept]);
                    ids.extend(padding);
                }
                PaddingMode::Left => {
                    ids.extend(padding);
                    ids.extend_from_slice(&row[row.len() - kept..]);
                }
            }
        }
        TokenBatch {
            ids,
            batch: rows.len(),
            len,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// Number of slots per row.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn row(&self, b: usize) -> &[u32] {
        &self.ids[b * self.len..(b + 1) * self.len]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u32]> {
        self.ids.chunks(self.len.max(1)).take(self.batch)
    }
}

/// Pad ragged rows into a dense batch. `length` defaults to the longest row.
pub fn pad(ragged: &[Vec<u32>], length: Option<usize>, pad_value: u32) -> TokenBatch {
    let length = length.unwrap_or_else(|| ragged.iter().map(Vec::len).max().unwrap_or(0));
    TokenBatch::from_rows(ragged, length, pad_value, PaddingMode::Right)
}

/// String-to-id mapping shared by every tokenizer.
///
/// Implementors split text into tokens and join tokens back; the vocabulary
/// lookups, special-token handling and padding are provided.
pub trait Tokenizer: Send + Sync {
    fn config(&self) -> &TokenizerConfig;

    /// The vocabulary, or an error if it has not been built yet.
    fn vocabulary(&self) -> Result<&Vocabulary>;

    /// Split one string into tokens.
    fn pretokenize(&self, text: &str) -> Result<Vec<String>>;

    /// Turn one row of ids back into a string.
    fn detokenize(&self, ids: &[u32]) -> Result<String>;

    fn detokenize_batch(&self, rows: &[Vec<u32>]) -> Result<Vec<String>> {
        rows.iter().map(|row| self.detokenize(row)).collect()
    }

    fn pad_token_id(&self) -> u32 {
        PAD_TOKEN_ID
    }

    fn oov_token_id(&self) -> u32 {
        OOV_TOKEN_ID
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.config().bos_token_id()
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.config().eos_token_id()
    }

    fn max_sequence_length(&self) -> Option<usize> {
        self.config().sequence_length
    }

    fn vocabulary_size(&self) -> Result<usize> {
        Ok(self.vocabulary()?.len())
    }

    /// Id of `token`, or the oov id for unknown tokens.
    fn token_to_id(&self, token: &str) -> Result<u32> {
        Ok(self.vocabulary()?.token_to_id(token).unwrap_or(OOV_TOKEN_ID))
    }

    /// Text of `id`, or the oov token for ids outside the vocabulary.
    fn id_to_token(&self, id: u32) -> Result<&str> {
        let vocabulary = self.vocabulary()?;
        Ok(vocabulary
            .id_to_token(id)
            .unwrap_or(self.config().oov_token.as_str()))
    }

    /// Token ids of each string with `[bos]`/`[eos]` attached, unpadded.
    fn tokenize_ragged(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
        let config = self.config();
        let vocabulary = self.vocabulary()?;
        texts
            .iter()
            .map(|text| {
                let joined = format!(
                    "{}{}{}",
                    config.bos_token().unwrap_or(""),
                    text,
                    config.eos_token().unwrap_or("")
                );
                Ok(self
                    .pretokenize(&joined)?
                    .iter()
                    .map(|token| vocabulary.token_to_id(token).unwrap_or(OOV_TOKEN_ID))
                    .collect::<Vec<u32>>())
            })
            .collect()
    }

    /// Dense token ids, padded (or truncated) to the configured sequence
    /// length on the configured side.
    fn tokenize(&self, texts: &[&str]) -> Result<TokenBatch> {
        let ragged = self.tokenize_ragged(texts)?;
        let len = self
            .max_sequence_length()
            .unwrap_or_else(|| ragged.iter().map(Vec::len).max().unwrap_or(0));
        Ok(TokenBatch::from_rows(&ragged, len, PAD_TOKEN_ID, self.config().padding_mode))
    }

    /// [`pad`] with the tokenizer's defaults: configured sequence length and
    /// the pad id.
    fn pad(&self, ragged: &[Vec<u32>], length: Option<usize>, pad_value: Option<u32>) -> TokenBatch {
        pad(
            ragged,
            length.or(self.max_sequence_length()),
            pad_value.unwrap_or(PAD_TOKEN_ID),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_token_ids() {
        let both = TokenizerConfig {
            add_bos: true,
            add_eos: true,
            ..TokenizerConfig::default()
        };
        assert_eq!(both.special_tokens(), vec!["[pad]", "[oov]", "[bos]", "[eos]"]);
        assert_eq!(both.bos_token_id(), Some(2));
        assert_eq!(both.eos_token_id(), Some(3));

        let eos_only = TokenizerConfig {
            add_eos: true,
            ..TokenizerConfig::default()
        };
        assert_eq!(eos_only.bos_token_id(), None);
        assert_eq!(eos_only.eos_token_id(), Some(2));
        assert_eq!(eos_only.special_tokens()[2], "[eos]");
    }

    #[test]
    fn test_config_from_json() {
        let config = TokenizerConfig::from_json_str(
            r#"{"sequence_length": 16, "add_bos": true, "padding_mode": "left"}"#,
        )
        .unwrap();
        assert_eq!(config.sequence_length, Some(16));
        assert_eq!(config.padding_mode, PaddingMode::Left);
        assert_eq!(config.oov_token, "[oov]");
    }

    #[test]
    fn test_config_rejects_fractional_length() {
        let err = TokenizerConfig::from_json_str(r#"{"sequence_length": 2.5}"#).unwrap_err();
        assert!(matches!(err, ModelError::ConfigParse(_)));
    }

    #[test]
    fn test_from_rows_right_and_left() {
        let rows = vec![vec![5, 6, 7], vec![8]];
        let right = TokenBatch::from_rows(&rows, 2, 0, PaddingMode::Right);
        assert_eq!(right.ids(), &[5, 6, 8, 0]);
        let left = TokenBatch::from_rows(&rows, 4, 0, PaddingMode::Left);
        assert_eq!(left.row(0), &[0, 5, 6, 7]);
        assert_eq!(left.row(1), &[0, 0, 0, 8]);
        let truncated = TokenBatch::from_rows(&rows, 2, 0, PaddingMode::Left);
        assert_eq!(truncated.row(0), &[6, 7]);
    }

    #[test]
    fn test_pad_defaults_to_longest() {
        let batch = pad(&[vec![1, 2], vec![3, 4, 5]], None, 9);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.ids(), &[1, 2, 9, 3, 4, 5]);
        assert_eq!(batch.rows().count(), 2);
    }

    #[test]
    fn test_token_batch_rejects_bad_length() {
        assert!(TokenBatch::new(vec![1, 2, 3], 2, 2).is_err());
    }
}
