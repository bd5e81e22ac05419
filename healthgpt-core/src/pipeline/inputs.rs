use crate::{vocab::IMAGE_TOKEN, ConfigError, PipelineError, TextTokenizer};

/// Tokenize `prompt`, mapping the `<image>` placeholder to `image_token_id` instead of
/// letting the tokenizer split it. At most one placeholder is accepted.
pub fn tokenize_with_image(
    prompt: &str,
    tokenizer: &dyn TextTokenizer,
    image_token_id: u32,
    bos: Option<u32>,
) -> Result<Vec<u32>, PipelineError> {
    let chunks: Vec<&str> = prompt.split(IMAGE_TOKEN).collect();
    let placeholders = chunks.len() - 1;
    if placeholders > 1 {
        return Err(ConfigError::PlaceholderCount(placeholders).into());
    }
    let mut ids: Vec<u32> = bos.into_iter().collect();
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            ids.push(image_token_id);
        }
        if !chunk.is_empty() {
            ids.extend(tokenizer.encode(chunk)?);
        }
    }
    Ok(ids)
}
