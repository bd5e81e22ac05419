use tokenizers::{AddedToken, Tokenizer};

use crate::PipelineError;

/// The tokenizer operations the pipeline relies on.
pub trait TextTokenizer: Send + Sync {
    /// Vocabulary size including added tokens.
    fn vocab_size(&self) -> usize;
    fn token_to_id(&self, token: &str) -> Option<u32>;
    /// Register `tokens` as special. Returns how many were new.
    fn add_special_tokens(&mut self, tokens: &[String]) -> usize;
    /// Encode without adding special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, PipelineError>;
}

impl TextTokenizer for Tokenizer {
    fn vocab_size(&self) -> usize {
        (**self).get_vocab_size(true)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }

    fn add_special_tokens(&mut self, tokens: &[String]) -> usize {
        let tokens: Vec<AddedToken> = tokens
            .iter()
            .map(|t| AddedToken::from(t.clone(), true))
            .collect();
        (**self).add_special_tokens(&tokens)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError> {
        (**self).encode(text, false)
            .map(|enc| enc.get_ids().to_vec())
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, PipelineError> {
        (**self).decode(ids, skip_special_tokens)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))
    }
}
