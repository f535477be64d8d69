use std::collections::HashMap;

use super::TokenizerConfig;

/// Immutable token <-> id mapping.
///
/// Ids `0..num_special` are the reserved tokens of the owning tokenizer's
/// config (pad first), followed by the learned tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    tokens: Vec<String>,
    token_to_id: HashMap<String, u32>,
    num_special: usize,
}

impl Vocabulary {
    /// Build from an explicit learned-token list, kept in the given order.
    /// Reserved tokens and repeats are skipped.
    pub fn from_tokens<S: AsRef<str>>(config: &TokenizerConfig, learned: &[S]) -> Self {
        let special = config.special_tokens();
        let mut tokens = special.clone();
        for token in learned {
            let token = token.as_ref();
            if !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
        Self::build(tokens, special.len())
    }

    /// Build from corpus token counts: most frequent first, ties broken by
    /// the token text in descending order. Reserved tokens are excluded from
    /// the learned part.
    pub fn from_counts(config: &TokenizerConfig, counts: &HashMap<String, u64>) -> Self {
        let special = config.special_tokens();
        let mut learned: Vec<(&String, u64)> = counts
            .iter()
            .filter(|(token, _)| !special.contains(*token))
            .map(|(token, &count)| (token, count))
            .collect();
        learned.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(a.0)));

        let num_special = special.len();
        let mut tokens = special;
        tokens.extend(learned.into_iter().map(|(token, _)| token.clone()));
        Self::build(tokens, num_special)
    }

    fn build(tokens: Vec<String>, num_special: usize) -> Self {
        let token_to_id = tokens
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id as u32))
            .collect();
        Vocabulary {
            tokens,
            token_to_id,
            num_special,
        }
    }

    /// Number of tokens, reserved ones included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn num_special(&self) -> usize {
        self.num_special
    }

    pub fn special_token_ids(&self) -> std::ops::Range<u32> {
        0..self.num_special as u32
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn learned_tokens(&self) -> &[String] {
        &self.tokens[self.num_special..]
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenizerConfig {
        TokenizerConfig {
            add_bos: true,
            add_eos: true,
            oov_token: "[unk]".to_string(),
            ..TokenizerConfig::default()
        }
    }

    #[test]
    fn test_reserved_ids_precede_learned() {
        let vocab = Vocabulary::from_tokens(&config(), &["A", "B"]);
        assert_eq!(vocab.tokens(), &["[pad]", "[unk]", "[bos]", "[eos]", "A", "B"]);
        assert_eq!(vocab.token_to_id("[pad]"), Some(0));
        assert_eq!(vocab.token_to_id("B"), Some(5));
        assert_eq!(vocab.id_to_token(4), Some("A"));
        assert_eq!(vocab.id_to_token(6), None);
        assert_eq!(vocab.learned_tokens(), &["A", "B"]);
        assert_eq!(vocab.special_token_ids(), 0..4);
    }

    #[test]
    fn test_from_tokens_skips_specials_and_repeats() {
        let vocab = Vocabulary::from_tokens(&config(), &["C", "[eos]", "C", "O"]);
        assert_eq!(vocab.learned_tokens(), &["C", "O"]);
    }

    #[test]
    fn test_from_counts_orders_by_frequency_then_token() {
        let counts: HashMap<String, u64> = [("C", 5), ("O", 2), ("N", 2), ("[bos]", 9), ("c", 7)]
            .into_iter()
            .map(|(t, c)| (t.to_string(), c))
            .collect();
        let vocab = Vocabulary::from_counts(&config(), &counts);
        assert_eq!(vocab.learned_tokens(), &["c", "C", "O", "N"]);
        assert_eq!(vocab.len(), 8);
    }
}
