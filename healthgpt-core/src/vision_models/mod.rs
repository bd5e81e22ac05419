use std::ops::Range;

use candle_core::{Device, Module, Tensor};
use healthgpt_lora::{ModuleKind, NamedParams};
use healthgpt_vision::{expand2square, mean_fill_color};
use image::{DynamicImage, GenericImageView};
use serde::Deserialize;

pub mod clip;
pub mod image_processor;
pub mod preprocessor_config;
pub mod projector;

use clip::ClipVisionTower;
use image_processor::ClipImageProcessor;
use projector::MmProjector;

use crate::{precision::placement::LeafPlacement, ConfigError, PipelineError};

fn d_projector_type() -> String {
    "mlp2x_gelu".to_string()
}

fn d_select_layer() -> isize {
    -2
}

fn d_select_feature() -> String {
    "patch".to_string()
}

/// Multimodal settings carried in the backbone's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct MultimodalConfig {
    #[serde(default = "d_projector_type")]
    pub mm_projector_type: String,
    pub mm_hidden_size: Option<usize>,
    #[serde(default = "d_select_layer")]
    pub mm_vision_select_layer: isize,
    #[serde(default = "d_select_feature")]
    pub mm_vision_select_feature: String,
}

impl Default for MultimodalConfig {
    fn default() -> Self {
        Self {
            mm_projector_type: d_projector_type(),
            mm_hidden_size: None,
            mm_vision_select_layer: d_select_layer(),
            mm_vision_select_feature: d_select_feature(),
        }
    }
}

/// Projected image features for one image: `(num_patches, hidden)`.
#[derive(Debug, Clone)]
pub struct VisionEmbeddingSequence {
    pub embeddings: Tensor,
    /// `(width, height)` of the image before padding.
    pub image_size: (u32, u32),
}

impl VisionEmbeddingSequence {
    pub fn len(&self) -> usize {
        self.embeddings.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Vision tower, projector and image preprocessing.
#[derive(Debug, Clone)]
pub struct VisionFusion {
    tower: ClipVisionTower,
    projector: MmProjector,
    processor: ClipImageProcessor,
}

impl VisionFusion {
    pub fn new(tower: ClipVisionTower, projector: MmProjector, processor: ClipImageProcessor) -> Self {
        Self {
            tower,
            projector,
            processor,
        }
    }

    pub fn projector_mut(&mut self) -> &mut MmProjector {
        &mut self.projector
    }

    /// Pad to a square with the mean color, preprocess, encode and project.
    pub fn encode(&self, image: &DynamicImage) -> Result<VisionEmbeddingSequence, PipelineError> {
        let image_size = image.dimensions();
        let fill = mean_fill_color(&self.processor.config().image_mean());
        let square = expand2square(image, fill)?;
        let encode = || -> candle_core::Result<Tensor> {
            let pixels = self
                .processor
                .preprocess(&square, self.tower.device())?
                .unsqueeze(0)?;
            let features = self.tower.forward(&pixels)?;
            self.projector.forward(&features)?.squeeze(0)
        };
        let embeddings = encode().map_err(PipelineError::Generation)?;
        Ok(VisionEmbeddingSequence {
            embeddings,
            image_size,
        })
    }

    pub fn placements(&self) -> Vec<LeafPlacement> {
        fn leaf(name: &str, kind: ModuleKind, t: &Tensor) -> LeafPlacement {
            LeafPlacement {
                name: name.to_string(),
                kind,
                device: t.device().clone(),
                dtype: t.dtype(),
                quantized: false,
            }
        }
        let mut leaves = Vec::new();
        // Tensors are reference counted, the clones share storage with `self`.
        let mut tower = self.tower.clone();
        let _ = tower.visit_params_mut(&mut |name, t| {
            leaves.push(leaf(name, ModuleKind::VisionTower, t));
            Ok(())
        });
        let mut projector = self.projector.clone();
        let _ = projector.visit_params_mut(&mut |name, t| {
            leaves.push(leaf(name, ModuleKind::Projector, t));
            Ok(())
        });
        leaves
    }
}

/// Prompt embeddings with the image placeholder replaced by the image embeddings.
#[derive(Debug, Clone)]
pub struct FusedInput {
    /// `(1, seq_len, hidden)`
    pub embeds: Tensor,
    pub seq_len: usize,
    /// Positions occupied by image embeddings.
    pub image_span: Option<Range<usize>>,
}

/// Splice `vision` into the embedded prompt at the single `image_token_id` position.
///
/// Without vision embeddings the prompt must not contain a placeholder. With them it must
/// contain exactly one, and the result has `ids.len() - 1 + vision.len()` positions.
pub fn fuse(
    ids: &[u32],
    image_token_id: u32,
    embed: impl Fn(&Tensor) -> candle_core::Result<Tensor>,
    vision: Option<&VisionEmbeddingSequence>,
    device: &Device,
) -> Result<FusedInput, PipelineError> {
    let positions: Vec<usize> = ids
        .iter()
        .enumerate()
        .filter(|(_, &id)| id == image_token_id)
        .map(|(i, _)| i)
        .collect();
    let embed_ids = |part: &[u32]| -> candle_core::Result<Tensor> {
        embed(&Tensor::new(part, device)?.unsqueeze(0)?)
    };
    match (vision, positions.as_slice()) {
        (None, []) => Ok(FusedInput {
            embeds: embed_ids(ids).map_err(PipelineError::Generation)?,
            seq_len: ids.len(),
            image_span: None,
        }),
        (Some(vision), &[pos]) => {
            let build = || -> candle_core::Result<Tensor> {
                let prefix = (pos > 0).then(|| embed_ids(&ids[..pos])).transpose()?;
                let suffix = (pos + 1 < ids.len())
                    .then(|| embed_ids(&ids[pos + 1..]))
                    .transpose()?;
                let dtype = prefix
                    .as_ref()
                    .or(suffix.as_ref())
                    .map_or(vision.embeddings.dtype(), |t| t.dtype());
                let image = vision
                    .embeddings
                    .to_device(device)?
                    .to_dtype(dtype)?
                    .unsqueeze(0)?;
                let parts: Vec<Tensor> = prefix.into_iter().chain([image]).chain(suffix).collect();
                Tensor::cat(&parts, 1)
            };
            Ok(FusedInput {
                embeds: build().map_err(PipelineError::Generation)?,
                seq_len: ids.len() - 1 + vision.len(),
                image_span: Some(pos..pos + vision.len()),
            })
        }
        (None, found) => Err(ConfigError::Invalid {
            name: "prompt",
            reason: format!("{} image placeholders but no image", found.len()),
        }
        .into()),
        (Some(_), found) => Err(ConfigError::PlaceholderCount(found.len()).into()),
    }
}
