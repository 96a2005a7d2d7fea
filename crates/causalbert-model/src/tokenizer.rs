//! Tokenizer adapter: text → fixed-length ids, attention mask, true length.

use std::path::Path;

use causalbert_core::{CausalBertError, Result};
use tokenizers::Tokenizer;

/// One tokenized text, right-padded to the requested length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedText {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Number of real tokens, special markers included.
    pub length: usize,
}

/// Text tokenizer producing `[CLS] … [SEP] [PAD]*` sequences.
pub trait TextTokenizer {
    fn tokenize(&self, text: &str, max_length: usize) -> Result<TokenizedText>;
}

/// [`TextTokenizer`] over a HuggingFace `tokenizers` model.
///
/// Special markers are resolved by name (`[CLS]`, `[SEP]`, `[PAD]`) and
/// added here, so truncation always keeps the closing `[SEP]`.
pub struct HfTokenizer {
    inner: Tokenizer,
    cls_id: u32,
    sep_id: u32,
    pad_id: u32,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| CausalBertError::Tokenization(format!("Failed to load tokenizer: {e}")))?;
        Self::new(inner)
    }

    /// Load from an in-memory `tokenizer.json` document.
    pub fn from_json(json: &str) -> Result<Self> {
        let inner = Tokenizer::from_bytes(json.as_bytes())
            .map_err(|e| CausalBertError::Tokenization(format!("Failed to parse tokenizer: {e}")))?;
        Self::new(inner)
    }

    pub fn new(inner: Tokenizer) -> Result<Self> {
        let lookup = |token: &str| {
            inner.token_to_id(token).ok_or_else(|| {
                CausalBertError::Tokenization(format!("Tokenizer has no '{token}' token"))
            })
        };
        let cls_id = lookup("[CLS]")?;
        let sep_id = lookup("[SEP]")?;
        let pad_id = inner.token_to_id("[PAD]").unwrap_or(0);
        Ok(Self {
            inner,
            cls_id,
            sep_id,
            pad_id,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl TextTokenizer for HfTokenizer {
    fn tokenize(&self, text: &str, max_length: usize) -> Result<TokenizedText> {
        if max_length < 2 {
            return Err(CausalBertError::Tokenization(format!(
                "max_length {max_length} cannot hold [CLS] and [SEP]"
            )));
        }
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| CausalBertError::Tokenization(format!("Tokenization failed: {e}")))?;

        let body = encoding.get_ids();
        let keep = body.len().min(max_length - 2);

        let mut ids = Vec::with_capacity(max_length);
        ids.push(self.cls_id);
        ids.extend_from_slice(&body[..keep]);
        ids.push(self.sep_id);
        let length = ids.len();

        ids.resize(max_length, self.pad_id);
        let mut attention_mask = vec![1_u32; length];
        attention_mask.resize(max_length, 0);

        Ok(TokenizedText {
            ids,
            attention_mask,
            length,
        })
    }
}

/// `tokenizer.json` for a lowercase whitespace word-level vocabulary.
///
/// Ids 0..=4 are `[PAD] [UNK] [CLS] [SEP] [MASK]`; `words` follow in order.
pub fn word_level_tokenizer_json(words: &[&str]) -> String {
    let mut vocab = serde_json::Map::new();
    for (i, token) in ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"]
        .iter()
        .chain(words)
        .enumerate()
    {
        vocab
            .entry(token.to_string())
            .or_insert_with(|| serde_json::Value::from(i as u64));
    }
    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "[UNK]"
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> HfTokenizer {
        HfTokenizer::from_json(&word_level_tokenizer_json(&[
            "the", "movie", "was", "great", "awful",
        ]))
        .unwrap()
    }

    #[test]
    fn test_pads_to_max_length() {
        let tok = tokenizer();
        let t = tok.tokenize("The movie was great", 8).unwrap();
        assert_eq!(t.ids, vec![2, 5, 6, 7, 8, 3, 0, 0]);
        assert_eq!(t.attention_mask, vec![1, 1, 1, 1, 1, 1, 0, 0]);
        assert_eq!(t.length, 6);
    }

    #[test]
    fn test_truncation_keeps_sep() {
        let tok = tokenizer();
        let t = tok.tokenize("the movie was great awful", 4).unwrap();
        assert_eq!(t.ids, vec![2, 5, 6, 3]);
        assert_eq!(t.length, 4);
        assert!(t.attention_mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn test_unknown_words_and_empty_text() {
        let tok = tokenizer();
        let t = tok.tokenize("zebra", 4).unwrap();
        assert_eq!(t.ids, vec![2, 1, 3, 0]);
        let empty = tok.tokenize("", 4).unwrap();
        assert_eq!(empty.ids, vec![2, 3, 0, 0]);
        assert_eq!(empty.length, 2);
    }

    #[test]
    fn test_rejects_tiny_max_length() {
        assert!(tokenizer().tokenize("the", 1).is_err());
    }

    #[test]
    fn test_missing_special_tokens() {
        let json = serde_json::json!({
            "version": "1.0",
            "model": { "type": "WordLevel", "vocab": { "a": 0, "[UNK]": 1 }, "unk_token": "[UNK]" }
        })
        .to_string();
        assert!(HfTokenizer::from_json(&json).is_err());
    }
}
