#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

// Phi-3 style decoder (fused qkv and gate/up projections), also used by Phi-4 checkpoints.
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::VarBuilder;
use either::Either;
use healthgpt_lora::{
    attach_adapters, AdapterSelector, HLoraConfig, LinearSlot, ModuleKind, ModulePath,
    NamedParams, TargetModules,
};
use serde::Deserialize;

use crate::{pipeline::generation::LanguageModel, precision::placement::LeafPlacement, vocab::TokenEmbeddings};

fn default_rope_theta() -> f64 {
    10_000.
}

fn default_partial_rotary_factor() -> f64 {
    1.
}

// https://huggingface.co/microsoft/Phi-3-mini-4k-instruct/blob/main/config.json
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_act: candle_nn::Activation,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    pub bos_token_id: Option<u32>,
    #[serde(default, with = "either::serde_untagged_optional")]
    pub eos_token_id: Option<Either<u32, Vec<u32>>>,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_partial_rotary_factor")]
    pub partial_rotary_factor: f64,
}

impl Config {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn eos_tokens(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(Either::Left(id)) => vec![*id],
            Some(Either::Right(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct RmsNorm {
    weight: Tensor,
    eps: f32,
}

impl RmsNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get(size, "weight")?,
            eps: eps as f32,
        })
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&xs.contiguous()?, &self.weight, self.eps)
    }
}

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
    rot_dim: usize,
}

impl RotaryEmbedding {
    fn new(dtype: DType, cfg: &Config, dev: &Device) -> Result<Self> {
        let rot_dim = (cfg.head_dim() as f64 * cfg.partial_rotary_factor) as usize;
        let max_seq_len = cfg.max_position_embeddings;
        let inv_freq: Vec<_> = (0..rot_dim)
            .step_by(2)
            .map(|i| 1f32 / cfg.rope_theta.powf(i as f64 / rot_dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, dev)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
            rot_dim,
        })
    }

    fn rotate(&self, xs: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = xs.dims4()?;
        let cos = self.cos.narrow(0, offset, seq_len)?.to_dtype(xs.dtype())?;
        let sin = self.sin.narrow(0, offset, seq_len)?.to_dtype(xs.dtype())?;
        if self.rot_dim == head_dim {
            return candle_nn::rotary_emb::rope(&xs.contiguous()?, &cos, &sin);
        }
        let rot = xs.narrow(D::Minus1, 0, self.rot_dim)?.contiguous()?;
        let pass = xs.narrow(D::Minus1, self.rot_dim, head_dim - self.rot_dim)?;
        let rot = candle_nn::rotary_emb::rope(&rot, &cos, &sin)?;
        Tensor::cat(&[rot, pass], D::Minus1)
    }

    fn forward(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.rotate(q, offset)?, self.rotate(k, offset)?))
    }
}

fn linear_slot(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<LinearSlot> {
    Ok(LinearSlot::new(vb.get((out_dim, in_dim), "weight")?, None))
}

#[derive(Debug)]
struct Attention {
    qkv_proj: LinearSlot,
    o_proj: LinearSlot,
    num_heads: usize,
    num_kv_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        let head_dim = cfg.head_dim();
        let op_size = num_heads * head_dim + 2 * num_kv_heads * head_dim;
        Ok(Self {
            qkv_proj: linear_slot(cfg.hidden_size, op_size, vb.pp("qkv_proj"))?,
            o_proj: linear_slot(num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            num_kv_groups: num_heads / num_kv_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
        rotary_emb: &RotaryEmbedding,
        kv_cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _) = xs.dims3()?;

        let qkv = self.qkv_proj.forward(xs)?;
        let query_pos = self.num_heads * self.head_dim;
        let kv_size = self.num_kv_heads * self.head_dim;
        let q = qkv.narrow(D::Minus1, 0, query_pos)?;
        let k = qkv.narrow(D::Minus1, query_pos, kv_size)?;
        let v = qkv.narrow(D::Minus1, query_pos + kv_size, kv_size)?;

        let q = q
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary_emb.forward(&q, &k, seqlen_offset)?;

        let (k, v) = match kv_cache.take() {
            None => (k, v),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, k], 2)?,
                Tensor::cat(&[prev_v, v], 2)?,
            ),
        };
        *kv_cache = Some((k.clone(), v.clone()));

        let k = candle_transformers::utils::repeat_kv(k, self.num_kv_groups)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, self.num_kv_groups)?.contiguous()?;

        let scale = 1f64 / f64::sqrt(self.head_dim as f64);
        let attn_weights = (q.contiguous()?.matmul(&k.t()?)? * scale)?;
        let attn_weights = match attention_mask {
            None => attn_weights,
            Some(mask) => attn_weights.broadcast_add(mask)?,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;
        let attn_output = attn_output.transpose(1, 2)?.reshape((b_sz, q_len, ()))?;
        self.o_proj.forward(&attn_output)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_up_proj: LinearSlot,
    down_proj: LinearSlot,
    act_fn: candle_nn::Activation,
    i_size: usize,
}

impl Mlp {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let i_size = cfg.intermediate_size;
        Ok(Self {
            gate_up_proj: linear_slot(hidden_size, 2 * i_size, vb.pp("gate_up_proj"))?,
            down_proj: linear_slot(i_size, hidden_size, vb.pp("down_proj"))?,
            act_fn: cfg.hidden_act,
            i_size,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let up_states = self.gate_up_proj.forward(xs)?;
        let gate = up_states.narrow(D::Minus1, 0, self.i_size)?;
        let up_states = up_states.narrow(D::Minus1, self.i_size, self.i_size)?;
        let up_states = (up_states * gate.apply(&self.act_fn))?;
        self.down_proj.forward(&up_states)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
        rotary_emb: &RotaryEmbedding,
        kv_cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self
            .self_attn
            .forward(&xs, attention_mask, seqlen_offset, rotary_emb, kv_cache)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = xs.apply(&self.post_attention_layernorm)?.apply(&self.mlp)?;
        residual + xs
    }

    fn slots_mut(&mut self, prefix: &ModulePath) -> [(ModulePath, &mut LinearSlot); 4] {
        let attn = prefix.join("self_attn");
        let mlp = prefix.join("mlp");
        [
            (attn.join("qkv_proj"), &mut self.self_attn.qkv_proj),
            (attn.join("o_proj"), &mut self.self_attn.o_proj),
            (mlp.join("gate_up_proj"), &mut self.mlp.gate_up_proj),
            (mlp.join("down_proj"), &mut self.mlp.down_proj),
        ]
    }

    fn slots(&self, prefix: &ModulePath) -> [(ModulePath, &LinearSlot); 4] {
        let attn = prefix.join("self_attn");
        let mlp = prefix.join("mlp");
        [
            (attn.join("qkv_proj"), &self.self_attn.qkv_proj),
            (attn.join("o_proj"), &self.self_attn.o_proj),
            (mlp.join("gate_up_proj"), &self.mlp.gate_up_proj),
            (mlp.join("down_proj"), &self.mlp.down_proj),
        ]
    }
}

/// The language backbone. Embedding and output head are plain tensors so their rows can
/// grow when the vocabulary is extended.
#[derive(Debug)]
pub struct Model {
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Tensor,
    tie_word_embeddings: bool,
    rotary_emb: RotaryEmbedding,
    cache: Vec<Option<(Tensor, Tensor)>>,
    device: Device,
    dtype: DType,
    max_seq_len: usize,
}

impl Model {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens = vb_m
            .pp("embed_tokens")
            .get((cfg.vocab_size, cfg.hidden_size), "weight")?;
        let vb_l = vb_m.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|layer_idx| DecoderLayer::new(cfg, vb_l.pp(layer_idx)))
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            embed_tokens.clone()
        } else {
            vb.pp("lm_head")
                .get((cfg.vocab_size, cfg.hidden_size), "weight")?
        };
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            tie_word_embeddings: cfg.tie_word_embeddings,
            rotary_emb: RotaryEmbedding::new(vb.dtype(), cfg, vb.device())?,
            cache: vec![None; cfg.num_hidden_layers],
            device: vb.device().clone(),
            dtype: vb.dtype(),
            max_seq_len: cfg.max_position_embeddings,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Every linear projection of the decoder layers with its ownership path.
    pub fn linear_slots_mut(&mut self) -> Vec<(ModulePath, &mut LinearSlot)> {
        let root = ModulePath::from("model.layers");
        self.layers
            .iter_mut()
            .enumerate()
            .flat_map(|(i, layer)| layer.slots_mut(&root.join(i)))
            .collect()
    }

    pub fn attach_adapters(
        &mut self,
        targets: &TargetModules,
        cfg: &HLoraConfig,
        selector: &AdapterSelector,
    ) -> healthgpt_lora::Result<usize> {
        let dtype = self.dtype;
        attach_adapters(self.linear_slots_mut(), targets, cfg, selector, dtype)
    }

    /// Device, dtype and representation of every leaf module.
    pub fn placements(&self) -> Vec<LeafPlacement> {
        fn leaf(name: String, kind: ModuleKind, t: &Tensor) -> LeafPlacement {
            LeafPlacement {
                name,
                kind,
                device: t.device().clone(),
                dtype: t.dtype(),
                quantized: false,
            }
        }
        let mut leaves = vec![leaf(
            "model.embed_tokens".to_string(),
            ModuleKind::Embedding,
            &self.embed_tokens,
        )];
        let root = ModulePath::from("model.layers");
        for (i, layer) in self.layers.iter().enumerate() {
            let prefix = root.join(i);
            leaves.push(leaf(
                prefix.join("input_layernorm").to_string(),
                ModuleKind::Norm,
                &layer.input_layernorm.weight,
            ));
            leaves.push(leaf(
                prefix.join("post_attention_layernorm").to_string(),
                ModuleKind::Norm,
                &layer.post_attention_layernorm.weight,
            ));
            for (path, slot) in layer.slots(&prefix) {
                let (dtype, device) = slot.base().dtype_and_device();
                leaves.push(LeafPlacement {
                    name: path.to_string(),
                    kind: ModuleKind::Linear,
                    device,
                    dtype,
                    quantized: slot.base().is_quantized(),
                });
                if let Some(lora) = slot.as_hlora() {
                    for k in 0..lora.nums() {
                        if let Some((a, b)) = lora.adapter(k) {
                            leaves.push(leaf(path.param(&format!("lora_A.{k}")), ModuleKind::Linear, a));
                            leaves.push(leaf(path.param(&format!("lora_B.{k}")), ModuleKind::Linear, b));
                        }
                    }
                }
            }
        }
        leaves.push(leaf("model.norm".to_string(), ModuleKind::Norm, &self.norm.weight));
        leaves.push(leaf("lm_head".to_string(), ModuleKind::LmHead, &self.lm_head));
        leaves
    }

    fn causal_mask(&self, q_len: usize, seqlen_offset: usize) -> Result<Tensor> {
        let mask: Vec<_> = (0..q_len)
            .flat_map(|i| {
                (0..q_len + seqlen_offset).map(move |j| {
                    if j > i + seqlen_offset {
                        f32::NEG_INFINITY
                    } else {
                        0.
                    }
                })
            })
            .collect();
        Tensor::from_slice(&mask, (q_len, q_len + seqlen_offset), &self.device)?
            .to_dtype(self.dtype)
    }
}

impl LanguageModel for Model {
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len) = input_ids.dims2()?;
        let hidden_size = self.embed_tokens.dim(1)?;
        self.embed_tokens
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b_sz, seq_len, hidden_size))
    }

    fn forward_embeds(&mut self, input_embeds: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let (_b_sz, seq_len, _) = input_embeds.dims3()?;
        if seqlen_offset + seq_len > self.max_seq_len {
            candle_core::bail!(
                "sequence of {} tokens exceeds the context window of {}",
                seqlen_offset + seq_len,
                self.max_seq_len
            );
        }
        let mask = if seq_len > 1 {
            Some(self.causal_mask(seq_len, seqlen_offset)?)
        } else {
            None
        };
        let mut xs = input_embeds.to_dtype(self.dtype)?;
        for (layer, kv_cache) in self.layers.iter().zip(self.cache.iter_mut()) {
            xs = layer.forward(
                &xs,
                mask.as_ref(),
                seqlen_offset,
                &self.rotary_emb,
                kv_cache,
            )?;
        }
        let xs = xs.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        let xs = self.norm.forward(&xs)?;
        xs.matmul(&self.lm_head.t()?)?.to_dtype(DType::F32)
    }

    fn clear_kv_cache(&mut self) {
        self.cache.iter_mut().for_each(|c| *c = None);
    }

    fn reorder_kv_cache(&mut self, indices: &Tensor) -> Result<()> {
        for (k, v) in self.cache.iter_mut().flatten() {
            *k = k.index_select(indices, 0)?;
            *v = v.index_select(indices, 0)?;
        }
        Ok(())
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl TokenEmbeddings for Model {
    fn embedding_rows(&self) -> usize {
        self.embed_tokens.dim(0).unwrap_or(0)
    }

    /// Grow the input embedding and the output head to `rows`. New rows are the mean of
    /// the existing rows, computed in f32. Existing rows are left untouched.
    fn resize_token_embeddings(&mut self, rows: usize) -> Result<usize> {
        let current = self.embed_tokens.dim(0)?;
        if rows <= current {
            return Ok(0);
        }
        let added = rows - current;
        let grow = |table: &Tensor| -> Result<Tensor> {
            let mean = table
                .to_dtype(DType::F32)?
                .mean_keepdim(0)?
                .to_dtype(table.dtype())?;
            let fill = mean.broadcast_as((added, table.dim(1)?))?;
            Tensor::cat(&[table, &fill], 0)
        };
        self.embed_tokens = grow(&self.embed_tokens)?;
        self.lm_head = if self.tie_word_embeddings {
            self.embed_tokens.clone()
        } else {
            grow(&self.lm_head)?
        };
        Ok(added)
    }
}

impl NamedParams for Model {
    fn visit_params_mut(
        &mut self,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        f("model.embed_tokens.weight", &mut self.embed_tokens)?;
        let root = ModulePath::from("model.layers");
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let prefix = root.join(i);
            f(
                &prefix.join("input_layernorm").param("weight"),
                &mut layer.input_layernorm.weight,
            )?;
            f(
                &prefix.join("post_attention_layernorm").param("weight"),
                &mut layer.post_attention_layernorm.weight,
            )?;
            for (path, slot) in layer.slots_mut(&prefix) {
                slot.visit_params_mut(&path, f)?;
            }
        }
        f("model.norm.weight", &mut self.norm.weight)?;
        if self.tie_word_embeddings {
            self.lm_head = self.embed_tokens.clone();
            Ok(())
        } else {
            f("lm_head.weight", &mut self.lm_head)
        }
    }
}
