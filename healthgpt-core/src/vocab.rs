use tracing::info;

use crate::{PipelineError, TextTokenizer};

/// Placeholder marking where the image embeddings are spliced into the prompt.
pub const IMAGE_TOKEN: &str = "<image>";
/// Opens a run of generated visual codebook indices.
pub const IMAGE_START_TOKEN: &str = "<start_index>";
/// Closes a run of generated visual codebook indices.
pub const IMAGE_END_TOKEN: &str = "<end_index>";

pub fn vq_index_token(i: usize) -> String {
    format!("<idx_{i}>")
}

/// A model whose token embedding table and output head can grow.
pub trait TokenEmbeddings {
    fn embedding_rows(&self) -> usize;
    /// Grow to `rows` rows, returning how many were added. Never shrinks.
    fn resize_token_embeddings(&mut self, rows: usize) -> candle_core::Result<usize>;
}

/// Ids of the tokens added for multimodal input and output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabularyExtension {
    pub image_token_id: u32,
    pub image_start_id: u32,
    pub image_end_id: u32,
    /// `vq_index_ids[i]` is the id of `<idx_i>`.
    pub vq_index_ids: Vec<u32>,
    /// Tokens newly added by this extension.
    pub added: usize,
}

impl VocabularyExtension {
    /// Register the image placeholder, the index delimiters and `vq_idx_nums` codebook
    /// tokens, then grow the model's tables to cover the tokenizer. Repeating the call
    /// adds nothing and yields the same ids.
    pub fn extend(
        tokenizer: &mut dyn TextTokenizer,
        model: &mut dyn TokenEmbeddings,
        vq_idx_nums: usize,
    ) -> Result<Self, PipelineError> {
        let mut tokens = vec![
            IMAGE_TOKEN.to_string(),
            IMAGE_START_TOKEN.to_string(),
            IMAGE_END_TOKEN.to_string(),
        ];
        tokens.extend((0..vq_idx_nums).map(vq_index_token));
        let missing: Vec<String> = tokens
            .iter()
            .filter(|t| tokenizer.token_to_id(t).is_none())
            .cloned()
            .collect();
        let added = if missing.is_empty() {
            0
        } else {
            tokenizer.add_special_tokens(&missing)
        };

        let id_of = |t: &str| {
            tokenizer
                .token_to_id(t)
                .ok_or_else(|| PipelineError::Tokenizer(format!("`{t}` was not registered")))
        };
        let image_token_id = id_of(IMAGE_TOKEN)?;
        let image_start_id = id_of(IMAGE_START_TOKEN)?;
        let image_end_id = id_of(IMAGE_END_TOKEN)?;
        let vq_index_ids = (0..vq_idx_nums)
            .map(|i| id_of(&vq_index_token(i)))
            .collect::<Result<Vec<_>, _>>()?;

        let rows = model.embedding_rows().max(tokenizer.vocab_size());
        let grown = model
            .resize_token_embeddings(rows)
            .map_err(|e| PipelineError::Load(e.into()))?;
        info!("Added {added} tokens to the vocabulary, embedding table grew by {grown} rows.");
        Ok(Self {
            image_token_id,
            image_start_id,
            image_end_id,
            vq_index_ids,
            added,
        })
    }

    /// Codebook index of a generated token, if it is one.
    pub fn vq_index_of(&self, id: u32) -> Option<usize> {
        let first = *self.vq_index_ids.first()?;
        let contiguous = id
            .checked_sub(first)
            .map(|i| i as usize)
            .filter(|&i| self.vq_index_ids.get(i) == Some(&id));
        contiguous.or_else(|| self.vq_index_ids.iter().position(|&v| v == id))
    }

    /// Codebook indices enclosed by the start and end markers in `ids`.
    pub fn vq_indices(&self, ids: &[u32]) -> Vec<usize> {
        ids.iter()
            .skip_while(|&&id| id != self.image_start_id)
            .skip(1)
            .take_while(|&&id| id != self.image_end_id)
            .filter_map(|&id| self.vq_index_of(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::VocabularyExtension;

    fn ext() -> VocabularyExtension {
        VocabularyExtension {
            image_token_id: 10,
            image_start_id: 11,
            image_end_id: 12,
            vq_index_ids: vec![13, 14, 15, 16],
            added: 7,
        }
    }

    #[test]
    fn codebook_lookup() {
        let e = ext();
        assert_eq!(e.vq_index_of(13), Some(0));
        assert_eq!(e.vq_index_of(16), Some(3));
        assert_eq!(e.vq_index_of(12), None);
        assert_eq!(e.vq_index_of(2), None);
    }

    #[test]
    fn indices_between_markers() {
        let e = ext();
        assert_eq!(e.vq_indices(&[5, 11, 14, 3, 16, 12, 13]), vec![1, 3]);
        assert!(e.vq_indices(&[13, 14]).is_empty());
    }
}
