#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

// Follows https://github.com/huggingface/transformers/blob/main/src/transformers/models/clip/modeling_clip.py
use std::path::Path;

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::VarBuilder;
use healthgpt_lora::{ModulePath, NamedParams};
use serde::Deserialize;

use crate::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    QuickGelu,
    Gelu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?),
            Activation::Gelu => xs.gelu_erf(),
        }
    }
}

fn d_hidden_size() -> usize {
    1024
}
fn d_intermediate_size() -> usize {
    4096
}
fn d_num_hidden_layers() -> usize {
    24
}
fn d_num_attention_heads() -> usize {
    16
}
fn d_num_channels() -> usize {
    3
}
fn d_image_size() -> usize {
    336
}
fn d_patch_size() -> usize {
    14
}
fn d_layer_norm_eps() -> f64 {
    1e-5
}
fn d_act() -> Activation {
    Activation::QuickGelu
}

/// Vision half of a CLIP config. Defaults describe ViT-L/14 at 336px.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipVisionConfig {
    #[serde(default = "d_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "d_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "d_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "d_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "d_num_channels")]
    pub num_channels: usize,
    #[serde(default = "d_image_size")]
    pub image_size: usize,
    #[serde(default = "d_patch_size")]
    pub patch_size: usize,
    #[serde(default = "d_act")]
    pub hidden_act: Activation,
    #[serde(default = "d_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl Default for ClipVisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: d_hidden_size(),
            intermediate_size: d_intermediate_size(),
            num_hidden_layers: d_num_hidden_layers(),
            num_attention_heads: d_num_attention_heads(),
            num_channels: d_num_channels(),
            image_size: d_image_size(),
            patch_size: d_patch_size(),
            hidden_act: d_act(),
            layer_norm_eps: d_layer_norm_eps(),
        }
    }
}

#[derive(Deserialize)]
struct FullClipConfig {
    vision_config: ClipVisionConfig,
}

impl ClipVisionConfig {
    /// Read either a full CLIP `config.json` (with a `vision_config` section) or a bare
    /// vision config.
    pub fn from_file(path: &Path) -> std::result::Result<Self, LoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        match serde_json::from_str::<FullClipConfig>(raw) {
            Ok(full) => Ok(full.vision_config),
            Err(_) => serde_json::from_str(raw),
        }
    }

    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

#[derive(Debug, Clone)]
struct Lin {
    weight: Tensor,
    bias: Tensor,
}

impl Lin {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get((out_dim, in_dim), "weight")?,
            bias: vb.get(out_dim, "bias")?,
        })
    }

    fn visit(
        &mut self,
        path: &ModulePath,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        f(&path.param("weight"), &mut self.weight)?;
        f(&path.param("bias"), &mut self.bias)
    }
}

impl Module for Lin {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::Linear::new(self.weight.clone(), Some(self.bias.clone())).forward(xs)
    }
}

#[derive(Debug, Clone)]
struct Norm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl Norm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get(size, "weight")?,
            bias: vb.get(size, "bias")?,
            eps,
        })
    }

    fn visit(
        &mut self,
        path: &ModulePath,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        f(&path.param("weight"), &mut self.weight)?;
        f(&path.param("bias"), &mut self.bias)
    }
}

impl Module for Norm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::LayerNorm::new(self.weight.clone(), self.bias.clone(), self.eps).forward(xs)
    }
}

#[derive(Debug, Clone)]
struct ClipVisionEmbeddings {
    patch_embedding: Tensor,
    class_embedding: Tensor,
    position_embedding: Tensor,
    patch_size: usize,
}

impl ClipVisionEmbeddings {
    fn new(vb: VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let num_positions = c.num_patches() + 1;
        Ok(Self {
            patch_embedding: vb.pp("patch_embedding").get(
                (c.hidden_size, c.num_channels, c.patch_size, c.patch_size),
                "weight",
            )?,
            class_embedding: vb.get(c.hidden_size, "class_embedding")?,
            position_embedding: vb
                .pp("position_embedding")
                .get((num_positions, c.hidden_size), "weight")?,
            patch_size: c.patch_size,
        })
    }

    fn visit(
        &mut self,
        path: &ModulePath,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        f(&path.join("patch_embedding").param("weight"), &mut self.patch_embedding)?;
        f(&path.param("class_embedding"), &mut self.class_embedding)?;
        f(
            &path.join("position_embedding").param("weight"),
            &mut self.position_embedding,
        )
    }
}

impl Module for ClipVisionEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let b_sz = pixel_values.dim(0)?;
        let patch_embeds = pixel_values
            .conv2d(&self.patch_embedding, 0, self.patch_size, 1, 1)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let hidden = self.class_embedding.dim(D::Minus1)?;
        let class_embeds = self.class_embedding.reshape((1, 1, hidden))?.expand((b_sz, 1, hidden))?;
        let embeddings = Tensor::cat(&[class_embeds, patch_embeds], 1)?;
        embeddings.broadcast_add(&self.position_embedding)
    }
}

#[derive(Debug, Clone)]
struct ClipAttention {
    q_proj: Lin,
    k_proj: Lin,
    v_proj: Lin,
    out_proj: Lin,
    head_dim: usize,
    scale: f64,
    num_attention_heads: usize,
}

impl ClipAttention {
    fn new(vb: VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let h = c.hidden_size;
        let head_dim = h / c.num_attention_heads;
        Ok(Self {
            q_proj: Lin::new(h, h, vb.pp("q_proj"))?,
            k_proj: Lin::new(h, h, vb.pp("k_proj"))?,
            v_proj: Lin::new(h, h, vb.pp("v_proj"))?,
            out_proj: Lin::new(h, h, vb.pp("out_proj"))?,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            num_attention_heads: c.num_attention_heads,
        })
    }

    fn shape(&self, xs: &Tensor, seq_len: usize, bsz: usize) -> Result<Tensor> {
        xs.reshape((bsz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .to_dtype(DType::F32)
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let in_dtype = xs.dtype();
        let (bsz, seq_len, hidden_size) = xs.dims3()?;
        let q = self.shape(&(self.q_proj.forward(xs)? * self.scale)?, seq_len, bsz)?;
        let k = self.shape(&self.k_proj.forward(xs)?, seq_len, bsz)?;
        let v = self.shape(&self.v_proj.forward(xs)?, seq_len, bsz)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&q.matmul(&k.t()?)?)?;
        let attn_output = attn_weights
            .matmul(&v)?
            .to_dtype(in_dtype)?
            .transpose(1, 2)?
            .reshape((bsz, seq_len, hidden_size))?;
        self.out_proj.forward(&attn_output)
    }

    fn visit(
        &mut self,
        path: &ModulePath,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        self.q_proj.visit(&path.join("q_proj"), f)?;
        self.k_proj.visit(&path.join("k_proj"), f)?;
        self.v_proj.visit(&path.join("v_proj"), f)?;
        self.out_proj.visit(&path.join("out_proj"), f)
    }
}

#[derive(Debug, Clone)]
struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: Norm,
    fc1: Lin,
    fc2: Lin,
    activation: Activation,
    layer_norm2: Norm,
}

impl ClipEncoderLayer {
    fn new(vb: VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        Ok(Self {
            self_attn: ClipAttention::new(vb.pp("self_attn"), c)?,
            layer_norm1: Norm::new(c.hidden_size, c.layer_norm_eps, vb.pp("layer_norm1"))?,
            fc1: Lin::new(c.hidden_size, c.intermediate_size, vb.pp("mlp").pp("fc1"))?,
            fc2: Lin::new(c.intermediate_size, c.hidden_size, vb.pp("mlp").pp("fc2"))?,
            activation: c.hidden_act,
            layer_norm2: Norm::new(c.hidden_size, c.layer_norm_eps, vb.pp("layer_norm2"))?,
        })
    }

    fn visit(
        &mut self,
        path: &ModulePath,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        self.self_attn.visit(&path.join("self_attn"), f)?;
        self.layer_norm1.visit(&path.join("layer_norm1"), f)?;
        self.fc1.visit(&path.join("mlp").join("fc1"), f)?;
        self.fc2.visit(&path.join("mlp").join("fc2"), f)?;
        self.layer_norm2.visit(&path.join("layer_norm2"), f)
    }
}

impl Module for ClipEncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(xs)?)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let ys = xs
            .apply(&self.layer_norm2)?
            .apply(&self.fc1)?
            .apply(&self.activation)?
            .apply(&self.fc2)?;
        ys + residual
    }
}

/// CLIP vision encoder exposing the hidden state of a selected layer, as used for
/// multimodal feature extraction.
#[derive(Debug, Clone)]
pub struct ClipVisionTower {
    embeddings: ClipVisionEmbeddings,
    pre_layrnorm: Norm,
    layers: Vec<ClipEncoderLayer>,
    select_layer: isize,
    config: ClipVisionConfig,
}

impl ClipVisionTower {
    pub const PREFIX: &'static str = "vision_model";

    /// `vb` points at the checkpoint root, parameters live under `vision_model.`.
    /// Layers past the selected one are never loaded.
    pub fn new(vb: VarBuilder, config: &ClipVisionConfig, select_layer: isize) -> Result<Self> {
        let vb = vb.pp(Self::PREFIX);
        // Hidden states are the embedding output followed by one entry per layer.
        let num_states = config.num_hidden_layers as isize + 1;
        let index = if select_layer < 0 {
            num_states + select_layer
        } else {
            select_layer
        };
        if index < 0 || index >= num_states {
            candle_core::bail!(
                "select_layer {select_layer} is out of range for {} layers",
                config.num_hidden_layers
            );
        }
        let vb_l = vb.pp("encoder").pp("layers");
        let layers = (0..index as usize)
            .map(|i| ClipEncoderLayer::new(vb_l.pp(i), config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings: ClipVisionEmbeddings::new(vb.pp("embeddings"), config)?,
            pre_layrnorm: Norm::new(config.hidden_size, config.layer_norm_eps, vb.pp("pre_layrnorm"))?,
            layers,
            select_layer,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ClipVisionConfig {
        &self.config
    }

    pub fn select_layer(&self) -> isize {
        self.select_layer
    }

    pub fn dtype(&self) -> DType {
        self.embeddings.class_embedding.dtype()
    }

    pub fn device(&self) -> &candle_core::Device {
        self.embeddings.class_embedding.device()
    }

    /// Patch features of the selected layer, class token dropped: `(b, num_patches, hidden)`.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = pixel_values
            .to_dtype(self.dtype())?
            .apply(&self.embeddings)?
            .apply(&self.pre_layrnorm)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        xs.i((.., 1..))
    }
}

impl NamedParams for ClipVisionTower {
    fn visit_params_mut(
        &mut self,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        let root = ModulePath::from(Self::PREFIX);
        self.embeddings.visit(&root.join("embeddings"), f)?;
        self.pre_layrnorm.visit(&root.join("pre_layrnorm"), f)?;
        let layers = root.join("encoder").join("layers");
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit(&layers.join(i), f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Activation, ClipVisionConfig};

    #[test]
    fn reads_nested_and_bare_configs() {
        let nested = r#"{"text_config": {}, "vision_config": {"hidden_size": 32, "patch_size": 14, "image_size": 28}}"#;
        let cfg = ClipVisionConfig::from_json(nested).unwrap();
        assert_eq!(cfg.hidden_size, 32);
        assert_eq!(cfg.num_patches(), 4);
        assert_eq!(cfg.hidden_act, Activation::QuickGelu);

        let bare = r#"{"num_hidden_layers": 2}"#;
        let cfg = ClipVisionConfig::from_json(bare).unwrap();
        assert_eq!(cfg.num_hidden_layers, 2);
        assert_eq!(cfg.image_size, 336);
    }
}
