use std::cmp::Ordering;

use candle_core::{Device, Result, Tensor, D};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ConfigError;

/// A decoder that accepts input embeddings and keeps its own KV cache.
pub trait LanguageModel {
    /// `(b, t)` token ids to `(b, t, hidden)` embeddings.
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor>;
    /// Run `(b, t, hidden)` embeddings starting at position `seqlen_offset`, returning f32
    /// logits of the last position, `(b, vocab)`.
    fn forward_embeds(&mut self, input_embeds: &Tensor, seqlen_offset: usize) -> Result<Tensor>;
    fn clear_kv_cache(&mut self);
    /// Rebuild the cache batch from the rows named by `indices`.
    fn reorder_kv_cache(&mut self, indices: &Tensor) -> Result<()>;
    fn device(&self) -> &Device;
}

fn d_max_new_tokens() -> usize {
    1024
}

fn d_num_beams() -> usize {
    1
}

fn d_seed() -> u64 {
    299792458
}

/// Decoding options. Greedy unless `do_sample` is set with a positive temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default = "d_num_beams")]
    pub num_beams: usize,
    #[serde(default = "d_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "d_seed")]
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            do_sample: false,
            temperature: 0.,
            top_p: None,
            num_beams: d_num_beams(),
            max_new_tokens: d_max_new_tokens(),
            seed: d_seed(),
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.num_beams == 0 {
            return Err(ConfigError::Invalid {
                name: "num_beams",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.temperature < 0. {
            return Err(ConfigError::Invalid {
                name: "temperature",
                reason: format!("{} is negative", self.temperature),
            });
        }
        if let Some(p) = self.top_p {
            if !(p > 0. && p <= 1.) {
                return Err(ConfigError::Invalid {
                    name: "top_p",
                    reason: format!("{p} is outside (0, 1]"),
                });
            }
        }
        Ok(())
    }

    pub fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= 0. {
            return Sampling::ArgMax;
        }
        match self.top_p {
            Some(p) if p < 1. => Sampling::TopP {
                p,
                temperature: self.temperature,
            },
            _ => Sampling::All {
                temperature: self.temperature,
            },
        }
    }
}

/// What a request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    Text(String),
    /// Generated visual codebook indices alongside the decoded text.
    Image { text: String, vq_indices: Vec<usize> },
}

impl GenerationOutput {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) | Self::Image { text, .. } => text,
        }
    }
}

/// Generate up to `max_new_tokens` token ids after `prompt` `(1, t, hidden)`. The stop
/// token is not included.
pub fn generate(
    model: &mut dyn LanguageModel,
    prompt: &Tensor,
    params: &GenerationParams,
    eos: &[u32],
) -> Result<Vec<u32>> {
    model.clear_kv_cache();
    if params.max_new_tokens == 0 {
        return Ok(Vec::new());
    }
    let out = if params.num_beams > 1 {
        beam_search(model, prompt, params, eos)
    } else {
        sample(model, prompt, params, eos)
    };
    model.clear_kv_cache();
    out
}

fn sample(
    model: &mut dyn LanguageModel,
    prompt: &Tensor,
    params: &GenerationParams,
    eos: &[u32],
) -> Result<Vec<u32>> {
    let mut processor = LogitsProcessor::from_sampling(params.seed, params.sampling());
    let mut offset = prompt.dim(1)?;
    let mut logits = model.forward_embeds(prompt, 0)?.squeeze(0)?;
    let mut tokens = Vec::new();
    for step in 0..params.max_new_tokens {
        let next = processor.sample(&logits)?;
        if eos.contains(&next) {
            debug!("Stop token after {step} tokens.");
            break;
        }
        tokens.push(next);
        if step + 1 == params.max_new_tokens {
            break;
        }
        let ids = Tensor::new(&[[next]], model.device())?;
        let embeds = model.embed(&ids)?;
        logits = model.forward_embeds(&embeds, offset)?.squeeze(0)?;
        offset += 1;
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    logprob: f64,
}

impl Hypothesis {
    fn score(&self) -> f64 {
        self.logprob / self.tokens.len().max(1) as f64
    }
}

/// The `k` largest entries of `row` as `(logprob, token)`.
fn top_k(row: &[f32], k: usize) -> Vec<(f64, u32)> {
    let mut idx: Vec<usize> = (0..row.len()).collect();
    let by_value = |a: &usize, b: &usize| row[*b].partial_cmp(&row[*a]).unwrap_or(Ordering::Equal);
    let k = k.min(row.len());
    if k < idx.len() && k > 0 {
        idx.select_nth_unstable_by(k - 1, by_value);
        idx.truncate(k);
    }
    idx.sort_unstable_by(by_value);
    idx.into_iter().map(|i| (row[i] as f64, i as u32)).collect()
}

/// Length-normalized beam search. Stops once `num_beams` hypotheses have finished or the
/// token budget is spent.
fn beam_search(
    model: &mut dyn LanguageModel,
    prompt: &Tensor,
    params: &GenerationParams,
    eos: &[u32],
) -> Result<Vec<u32>> {
    let num_beams = params.num_beams;
    let mut offset = prompt.dim(1)?;
    let logits = model.forward_embeds(prompt, 0)?;
    let mut logprobs = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;
    let mut live = vec![Hypothesis {
        tokens: Vec::new(),
        logprob: 0.,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    for step in 0..params.max_new_tokens {
        let mut candidates: Vec<(f64, usize, u32)> = live
            .iter()
            .zip(&logprobs)
            .enumerate()
            .flat_map(|(b, (hyp, row))| {
                top_k(row, 2 * num_beams)
                    .into_iter()
                    .map(move |(lp, tok)| (hyp.logprob + lp, b, tok))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut next: Vec<(usize, Hypothesis)> = Vec::with_capacity(num_beams);
        for (logprob, parent, tok) in candidates {
            let mut tokens = live[parent].tokens.clone();
            if eos.contains(&tok) {
                finished.push(Hypothesis { tokens, logprob });
            } else {
                tokens.push(tok);
                next.push((parent, Hypothesis { tokens, logprob }));
            }
            if next.len() == num_beams {
                break;
            }
        }
        if finished.len() >= num_beams || next.is_empty() {
            live.clear();
            break;
        }
        live = next.iter().map(|(_, h)| h.clone()).collect();
        if step + 1 == params.max_new_tokens {
            break;
        }

        let parents: Vec<u32> = next.iter().map(|(p, _)| *p as u32).collect();
        let parents = Tensor::new(parents.as_slice(), model.device())?;
        model.reorder_kv_cache(&parents)?;
        let last: Vec<u32> = live
            .iter()
            .filter_map(|h| h.tokens.last().copied())
            .collect();
        let ids = Tensor::new(last.as_slice(), model.device())?.unsqueeze(1)?;
        let embeds = model.embed(&ids)?;
        let logits = model.forward_embeds(&embeds, offset)?;
        logprobs = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;
        offset += 1;
    }

    finished.extend(live);
    Ok(finished
        .into_iter()
        .max_by(|a, b| a.score().partial_cmp(&b.score()).unwrap_or(Ordering::Equal))
        .map(|h| h.tokens)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use candle_transformers::generation::Sampling;

    use super::{top_k, GenerationParams};

    #[test]
    fn greedy_unless_sampling_with_temperature() {
        let mut p = GenerationParams::default();
        assert!(matches!(p.sampling(), Sampling::ArgMax));
        p.do_sample = true;
        assert!(matches!(p.sampling(), Sampling::ArgMax));
        p.temperature = 0.7;
        assert!(matches!(p.sampling(), Sampling::All { .. }));
        p.top_p = Some(0.9);
        assert!(matches!(p.sampling(), Sampling::TopP { .. }));
    }

    #[test]
    fn validation() {
        let mut p = GenerationParams::default();
        assert!(p.validate().is_ok());
        p.num_beams = 0;
        assert!(p.validate().is_err());
        p.num_beams = 2;
        p.top_p = Some(1.5);
        assert!(p.validate().is_err());
    }

    #[test]
    fn top_k_is_sorted() {
        let row = [0.1, -3.0, 2.0, 0.5, 1.0];
        let best: Vec<u32> = top_k(&row, 3).into_iter().map(|(_, t)| t).collect();
        assert_eq!(best, vec![2, 4, 3]);
        assert_eq!(top_k(&row, 10).len(), 5);
    }
}
