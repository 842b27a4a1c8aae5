use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Errors raised by tokenizer adapters
#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("Failed to load tokenizer: {0}")]
    Load(String),

    #[error("Failed to encode text: {0}")]
    Encode(String),

    #[error("Failed to decode tokens: {0}")]
    Decode(String),

    #[error("Tokenizer vocabulary has none of the special tokens {0:?}")]
    MissingSpecialToken(&'static [&'static str]),
}

/// Text to token-id conversion over a loaded vocabulary
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError>;

    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError>;

    fn bos_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> u32;
}

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>"];
const BOS_CANDIDATES: &[&str] = &["<s>", "<|startoftext|>"];

/// Adapter over a HuggingFace `tokenizer.json`
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    bos: Option<u32>,
    eos: u32,
}

impl HfTokenizer {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenizerError> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| TokenizerError::Load(e.to_string()))?;
        Self::with_inner(inner)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TokenizerError> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| TokenizerError::Load(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::with_inner(inner)
    }

    fn with_inner(inner: tokenizers::Tokenizer) -> Result<Self, TokenizerError> {
        let lookup = |candidates: &[&str]| candidates.iter().find_map(|t| inner.token_to_id(t));

        let eos = lookup(EOS_CANDIDATES).ok_or(TokenizerError::MissingSpecialToken(EOS_CANDIDATES))?;
        let bos = lookup(BOS_CANDIDATES);
        debug!("Loaded tokenizer (bos={:?}, eos={})", bos, eos);

        Ok(Self { inner, bos, eos })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TokenizerError::Encode(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError> {
        self.inner
            .decode(ids, false)
            .map_err(|e| TokenizerError::Decode(e.to_string()))
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    fn eos_token_id(&self) -> u32 {
        self.eos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_level_json(vocab: &str) -> String {
        format!(
            r#"{{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": {{ "type": "Whitespace" }},
                "post_processor": null,
                "decoder": null,
                "model": {{ "type": "WordLevel", "vocab": {}, "unk_token": "<unk>" }}
            }}"#,
            vocab
        )
    }

    #[test]
    fn test_resolves_special_tokens() {
        let json = word_level_json(r#"{ "<unk>": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4 }"#);
        let tokenizer = HfTokenizer::from_bytes(json.as_bytes()).unwrap();

        assert_eq!(tokenizer.bos_token_id(), Some(1));
        assert_eq!(tokenizer.eos_token_id(), 2);
        assert_eq!(tokenizer.encode("hello world").unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_missing_eos_fails() {
        let json = word_level_json(r#"{ "<unk>": 0, "hello": 1 }"#);
        let result = HfTokenizer::from_bytes(json.as_bytes());
        assert!(matches!(result, Err(TokenizerError::MissingSpecialToken(_))));
    }

    #[test]
    fn test_invalid_json_fails_to_load() {
        let result = HfTokenizer::from_bytes(b"not a tokenizer");
        assert!(matches!(result, Err(TokenizerError::Load(_))));
    }
}
