// SPDX-License-Identifier: MIT OR Apache-2.0

//! `HuggingFace` tokenizer wrapper.
//!
//! [`SteerTokenizer`] turns prompts into the token IDs that
//! [`SteerModel`](crate::SteerModel) consumes and decodes generated IDs
//! back into text.

use std::path::Path;

use crate::error::{Result, SteerError};

/// End-of-sequence spellings checked by [`SteerTokenizer::eos_token_id`],
/// most common first.
const EOS_CANDIDATES: [&str; 7] = [
    "<|endoftext|>",
    "</s>",
    "<eos>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
    "<|end|>",
];

/// Tokenizer backed by the `tokenizers` crate.
///
/// # Example
///
/// ```no_run
/// use candle_steer::SteerTokenizer;
///
/// # fn main() -> candle_steer::Result<()> {
/// let tok = SteerTokenizer::from_pretrained("openai-community/gpt2")?;
/// let ids = tok.encode("I love talking about weddings")?;
/// let text = tok.decode(&ids)?;
/// assert_eq!(text, "I love talking about weddings");
/// # Ok(())
/// # }
/// ```
pub struct SteerTokenizer {
    /// Underlying tokenizer.
    inner: Box<tokenizers::Tokenizer>,
}

impl SteerTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tok = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            SteerError::Tokenizer(format!("failed to load tokenizer from {}: {e}", path.display()))
        })?;
        Ok(Self::from_hf(tok))
    }

    /// Fetch `tokenizer.json` from a hub repository and load it.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Download`] if the file cannot be fetched, or
    /// [`SteerError::Tokenizer`] if it cannot be parsed.
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let path = crate::download::download_file(model_id, "tokenizer.json")?;
        Self::from_file(path)
    }

    /// Wrap an already-loaded tokenizer.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        Self {
            inner: Box::new(tokenizer),
        }
    }

    /// Encode text, adding special tokens per the tokenizer's post-processor.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, true)
    }

    /// Encode text **without** special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, false)
    }

    /// Shared encode path.
    fn encode_with(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| SteerError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to a string.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| SteerError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Vocabulary size, including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// ID of a token string, if it is in the vocabulary.
    #[must_use]
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// ID of the first well-known end-of-sequence token present.
    #[must_use]
    pub fn eos_token_id(&self) -> Option<u32> {
        EOS_CANDIDATES.iter().find_map(|t| self.token_id(t))
    }
}

impl std::fmt::Debug for SteerTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SteerTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// Word-level tokenizer over a handful of words.
    fn word_level() -> SteerTokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "<unk>": 0, "</s>": 1, "love": 2, "hate": 3, "I": 4 },
                "unk_token": "<unk>"
            }
        }"#;
        SteerTokenizer::from_hf(tokenizers::Tokenizer::from_str(json).unwrap())
    }

    #[test]
    fn encode_maps_words_to_ids() {
        let tok = word_level();
        assert_eq!(tok.encode("I love").unwrap(), vec![4, 2]);
        assert_eq!(tok.encode_raw("I hate").unwrap(), vec![4, 3]);
        assert_eq!(tok.encode("unknown").unwrap(), vec![0]);
    }

    #[test]
    fn eos_lookup_finds_known_spelling() {
        let tok = word_level();
        assert_eq!(tok.eos_token_id(), Some(1));
        assert_eq!(tok.token_id("love"), Some(2));
        assert_eq!(tok.token_id("missing"), None);
        assert_eq!(tok.vocab_size(), 5);
    }
}
