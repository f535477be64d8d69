use std::collections::HashMap;

use fancy_regex::Regex;
use tracing::{debug, warn};

use super::{Tokenizer, TokenizerConfig, Vocabulary, OOV_TOKEN_ID, SEP_TOKEN};
use crate::error::{ModelError, Result};

/// Bracket atoms, two-letter halogens, organic-subset and aromatic atoms,
/// bonds, branches, ring closures (including `%NN`) and reaction arrows.
const SMILES_PATTERN: &str = r"(\[[^\]]+\]|Br?|Cl?|N|O|S|P|F|I|b|c|n|o|s|p|\(|\)|\.|=|#|-|\+|\\|/|:|~|@|\?|>>?|\*|\$|%[0-9]{2}|[0-9])";

/// Removed from detokenized text: padding, `[bos]`, and everything from the
/// first `[eos]` on.
const CLEANUP_PATTERN: &str = r"\[pad\]|\[bos\]|\[eos\].*";

/// Regex-based SMILES tokenizer.
#[derive(Debug)]
pub struct SmilesTokenizer {
    config: TokenizerConfig,
    vocabulary: Option<Vocabulary>,
    splitter: Regex,
    cleanup: Regex,
}

impl SmilesTokenizer {
    /// A tokenizer without a vocabulary; call [`adapt`](Self::adapt) before
    /// tokenizing.
    pub fn new(config: TokenizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(SmilesTokenizer {
            config,
            vocabulary: None,
            splitter: Regex::new(SMILES_PATTERN)?,
            cleanup: Regex::new(CLEANUP_PATTERN)?,
        })
    }

    /// A tokenizer with a fixed learned vocabulary, in the given order.
    pub fn with_vocabulary<S: AsRef<str>>(config: TokenizerConfig, learned: &[S]) -> Result<Self> {
        let mut tokenizer = Self::new(config)?;
        tokenizer.vocabulary = Some(Vocabulary::from_tokens(&tokenizer.config, learned));
        Ok(tokenizer)
    }

    /// Build the vocabulary from a corpus of SMILES strings.
    ///
    /// With `adapt_sequence_length`, the dense sequence length becomes the
    /// longest pretokenized corpus entry.
    pub fn adapt<S: AsRef<str>>(&mut self, corpus: &[S], adapt_sequence_length: bool) -> Result<()> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut longest = 0;
        for text in corpus {
            let tokens = self.pretokenize(text.as_ref())?;
            longest = longest.max(tokens.len());
            for token in tokens {
                *counts.entry(token).or_insert(0) += 1;
            }
        }
        if adapt_sequence_length {
            if longest == 0 {
                return Err(ModelError::TokenizerError(
                    "cannot adapt sequence length to an empty corpus".to_string(),
                ));
            }
            self.config.sequence_length = Some(longest);
        }
        let vocabulary = Vocabulary::from_counts(&self.config, &counts);
        debug!(
            entries = corpus.len(),
            vocabulary_size = vocabulary.len(),
            sequence_length = ?self.config.sequence_length,
            "adapted tokenizer"
        );
        self.vocabulary = Some(vocabulary);
        Ok(())
    }

    /// Separator configured for reaction strings, `[sep]` by default.
    pub fn sep_token(&self) -> &str {
        self.config.sep_token.as_deref().unwrap_or(SEP_TOKEN)
    }

    /// Everything up to and including the last separator: the reaction
    /// prompt without its product.
    pub fn truncate_product(smiles: &str, sep: &str) -> String {
        let parts: Vec<&str> = smiles.split(sep).collect();
        let mut prompt = parts[..parts.len() - 1].join(sep);
        prompt.push_str(sep);
        prompt
    }

    /// The part after the last separator.
    pub fn extract_product(smiles: &str, sep: &str) -> String {
        smiles.rsplit(sep).next().unwrap_or(smiles).to_string()
    }

    fn strip_markup(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for found in self.cleanup.find_iter(text) {
            let found = found.map_err(ModelError::from)?;
            out.push_str(&text[last..found.start()]);
            last = found.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

impl Tokenizer for SmilesTokenizer {
    fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    fn vocabulary(&self) -> Result<&Vocabulary> {
        self.vocabulary.as_ref().ok_or_else(|| {
            ModelError::TokenizerError(
                "lookup tables have not been built; adapt the tokenizer or supply a vocabulary"
                    .to_string(),
            )
        })
    }

    /// Regex split that keeps every match and any unmatched text between
    /// matches as tokens.
    fn pretokenize(&self, text: &str) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        let mut last = 0;
        for found in self.splitter.find_iter(text) {
            let found = found.map_err(ModelError::from)?;
            if found.start() > last {
                tokens.push(text[last..found.start()].to_string());
            }
            tokens.push(found.as_str().to_string());
            last = found.end();
        }
        if last < text.len() {
            tokens.push(text[last..].to_string());
        }
        Ok(tokens)
    }

    fn detokenize(&self, ids: &[u32]) -> Result<String> {
        let vocabulary = self.vocabulary()?;
        let mut joined = String::new();
        for &id in ids {
            match vocabulary.id_to_token(id) {
                Some(token) => {
                    if id == OOV_TOKEN_ID {
                        warn!(id, "unknown token in detokenized sequence");
                    }
                    joined.push_str(token);
                }
                None => {
                    warn!(id, vocabulary_size = vocabulary.len(), "token id outside vocabulary");
                    joined.push_str(&self.config.oov_token);
                }
            }
        }
        self.strip_markup(&joined)
    }
}
