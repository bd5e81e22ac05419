#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use candle_core::{DType, Device, Tensor};
use healthgpt_core::{
    models::phi3,
    vision_models::{
        clip::ClipVisionConfig, preprocessor_config::PreProcessorConfig, MultimodalConfig,
    },
    CheckpointSource, HLoraConfig, LoadError, LoadTarget, PipelineConfig, PipelineError,
    PipelineSources, TextTokenizer, VisionSources,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

pub const BASE_VOCAB: usize = 32;
pub const HIDDEN: usize = 64;
pub const VISION_HIDDEN: usize = 32;
pub const NUM_PATCHES: usize = 4;

const WORDS: [&str; 24] = [
    "<unk>",
    "<s>",
    "</s>",
    "<|end|>",
    "<|endoftext|>",
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
    "You",
    "are",
    "a",
    "helpful",
    "assistant.",
    "What",
    "is",
    "shown?",
    "Describe",
    "the",
    "chest",
    "scan",
    "lesion",
    "left",
    "lung",
    "normal",
];

/// Whitespace tokenizer over a fixed word list. Unknown words map to `<unk>`.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: Vec<String>,
    ids: HashMap<String, u32>,
    special: HashSet<u32>,
}

impl WordTokenizer {
    pub fn new() -> Self {
        let mut vocab: Vec<String> = WORDS.iter().map(|w| w.to_string()).collect();
        vocab.extend((vocab.len()..BASE_VOCAB).map(|i| format!("w{i}")));
        let ids = vocab
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        Self {
            vocab,
            ids,
            special: (0..8).collect(),
        }
    }
}

impl TextTokenizer for WordTokenizer {
    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    fn add_special_tokens(&mut self, tokens: &[String]) -> usize {
        let mut added = 0;
        for token in tokens {
            if self.ids.contains_key(token) {
                continue;
            }
            let id = self.vocab.len() as u32;
            self.vocab.push(token.clone());
            self.ids.insert(token.clone(), id);
            self.special.insert(id);
            added += 1;
        }
        added
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError> {
        Ok(text
            .split_whitespace()
            .map(|w| self.ids.get(w).copied().unwrap_or(0))
            .collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, PipelineError> {
        let words = ids
            .iter()
            .filter(|id| !(skip_special_tokens && self.special.contains(id)))
            .map(|&id| {
                self.vocab
                    .get(id as usize)
                    .cloned()
                    .ok_or_else(|| PipelineError::Tokenizer(format!("unknown id {id}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(words.join(" "))
    }
}

/// Tensors held in memory. Counts every load and can refuse direct placement.
#[derive(Debug, Clone)]
pub struct MemoryCheckpoint {
    pub tensors: HashMap<String, Tensor>,
    pub reject_direct: bool,
    pub loads: Arc<AtomicUsize>,
}

impl MemoryCheckpoint {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self {
            tensors,
            reject_direct: false,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn rejecting_direct(mut self) -> Self {
        self.reject_direct = true;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl CheckpointSource for MemoryCheckpoint {
    fn describe(&self) -> String {
        format!("{} in-memory tensors", self.tensors.len())
    }

    fn load(&self, target: &LoadTarget, dtype: DType) -> Result<HashMap<String, Tensor>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let (true, LoadTarget::Direct(device)) = (self.reject_direct, target) {
            return Err(LoadError::UnsupportedPlacement {
                device: format!("{device:?}"),
                reason: "device map not supported".to_string(),
            });
        }
        let device = target.device();
        self.tensors
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.to_device(&device)?.to_dtype(dtype)?)))
            .collect::<candle_core::Result<_>>()
            .map_err(LoadError::Candle)
    }
}

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0f32, 0.02, shape, &Device::Cpu).unwrap()
}

fn ones(n: usize) -> Tensor {
    Tensor::ones(n, DType::F32, &Device::Cpu).unwrap()
}

fn zeros(n: usize) -> Tensor {
    Tensor::zeros(n, DType::F32, &Device::Cpu).unwrap()
}

/// The backbone `config.json`, multimodal keys included.
pub fn phi3_config_json() -> serde_json::Value {
    serde_json::json!({
        "vocab_size": BASE_VOCAB,
        "hidden_act": "silu",
        "hidden_size": HIDDEN,
        "intermediate_size": 128,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "bos_token_id": 1,
        "eos_token_id": 2,
        "max_position_embeddings": 256,
        "tie_word_embeddings": false,
        "mm_projector_type": "mlp2x_gelu",
        "mm_hidden_size": VISION_HIDDEN
    })
}

pub fn phi3_config() -> phi3::Config {
    serde_json::from_value(phi3_config_json()).unwrap()
}

/// A word-level `tokenizer.json` with the same ids as [`WordTokenizer`].
pub fn tokenizer_json() -> serde_json::Value {
    let tokenizer = WordTokenizer::new();
    let vocab: serde_json::Map<String, serde_json::Value> = tokenizer
        .vocab
        .iter()
        .enumerate()
        .map(|(i, w)| (w.clone(), serde_json::json!(i)))
        .collect();
    let added: Vec<serde_json::Value> = (0..8)
        .map(|i| {
            serde_json::json!({
                "id": i,
                "content": tokenizer.vocab[i],
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();
    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    })
}

pub fn multimodal_config() -> MultimodalConfig {
    MultimodalConfig {
        mm_hidden_size: Some(VISION_HIDDEN),
        ..MultimodalConfig::default()
    }
}

/// Random tiny backbone weights.
pub fn backbone_weights() -> HashMap<String, Tensor> {
    let cfg = phi3_config();
    let head_dim = cfg.head_dim();
    let qkv = cfg.num_attention_heads * head_dim + 2 * cfg.num_kv_heads() * head_dim;
    let mut w = HashMap::new();
    w.insert(
        "model.embed_tokens.weight".to_string(),
        randn(&[BASE_VOCAB, HIDDEN]),
    );
    for i in 0..cfg.num_hidden_layers {
        let p = format!("model.layers.{i}");
        w.insert(format!("{p}.self_attn.qkv_proj.weight"), randn(&[qkv, HIDDEN]));
        w.insert(
            format!("{p}.self_attn.o_proj.weight"),
            randn(&[HIDDEN, cfg.num_attention_heads * head_dim]),
        );
        w.insert(
            format!("{p}.mlp.gate_up_proj.weight"),
            randn(&[2 * cfg.intermediate_size, HIDDEN]),
        );
        w.insert(
            format!("{p}.mlp.down_proj.weight"),
            randn(&[HIDDEN, cfg.intermediate_size]),
        );
        w.insert(format!("{p}.input_layernorm.weight"), ones(HIDDEN));
        w.insert(format!("{p}.post_attention_layernorm.weight"), ones(HIDDEN));
    }
    w.insert("model.norm.weight".to_string(), ones(HIDDEN));
    w.insert("lm_head.weight".to_string(), randn(&[BASE_VOCAB, HIDDEN]));
    w
}

/// `mlp2x_gelu` projector weights as the fusion layer file names them.
pub fn projector_weights() -> HashMap<String, Tensor> {
    let mut w = HashMap::new();
    w.insert(
        "model.mm_projector.0.weight".to_string(),
        randn(&[HIDDEN, VISION_HIDDEN]),
    );
    w.insert("model.mm_projector.0.bias".to_string(), zeros(HIDDEN));
    w.insert(
        "model.mm_projector.2.weight".to_string(),
        randn(&[HIDDEN, HIDDEN]),
    );
    w.insert("model.mm_projector.2.bias".to_string(), zeros(HIDDEN));
    w
}

pub fn backbone_with_projector() -> HashMap<String, Tensor> {
    let mut w = backbone_weights();
    w.extend(projector_weights());
    w
}

pub const CLIP_CONFIG_JSON: &str = r#"{"vision_config": {"hidden_size": 32, "intermediate_size": 64,
    "num_hidden_layers": 2, "num_attention_heads": 4, "image_size": 28, "patch_size": 14}}"#;

pub fn clip_config() -> ClipVisionConfig {
    ClipVisionConfig::from_json(CLIP_CONFIG_JSON).unwrap()
}

/// Random tiny CLIP vision weights (plus a text tower entry that must be ignored).
pub fn clip_weights() -> HashMap<String, Tensor> {
    let c = clip_config();
    let h = c.hidden_size;
    let mut w = HashMap::new();
    let e = "vision_model.embeddings";
    w.insert(
        format!("{e}.patch_embedding.weight"),
        randn(&[h, c.num_channels, c.patch_size, c.patch_size]),
    );
    w.insert(format!("{e}.class_embedding"), randn(&[h]));
    w.insert(
        format!("{e}.position_embedding.weight"),
        randn(&[c.num_patches() + 1, h]),
    );
    w.insert("vision_model.pre_layrnorm.weight".to_string(), ones(h));
    w.insert("vision_model.pre_layrnorm.bias".to_string(), zeros(h));
    for i in 0..c.num_hidden_layers {
        let p = format!("vision_model.encoder.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            w.insert(format!("{p}.self_attn.{proj}.weight"), randn(&[h, h]));
            w.insert(format!("{p}.self_attn.{proj}.bias"), zeros(h));
        }
        for norm in ["layer_norm1", "layer_norm2"] {
            w.insert(format!("{p}.{norm}.weight"), ones(h));
            w.insert(format!("{p}.{norm}.bias"), zeros(h));
        }
        w.insert(
            format!("{p}.mlp.fc1.weight"),
            randn(&[c.intermediate_size, h]),
        );
        w.insert(format!("{p}.mlp.fc1.bias"), zeros(c.intermediate_size));
        w.insert(
            format!("{p}.mlp.fc2.weight"),
            randn(&[h, c.intermediate_size]),
        );
        w.insert(format!("{p}.mlp.fc2.bias"), zeros(h));
    }
    w.insert(
        "text_model.embeddings.token_embedding.weight".to_string(),
        randn(&[8, h]),
    );
    w
}

pub fn pipeline_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::new("memory");
    cfg.hlora = HLoraConfig {
        rank: 4,
        alpha: 8.0,
        dropout: 0.0,
        nums: 2,
    };
    cfg.vq_idx_nums = 8;
    cfg.cpu = true;
    cfg
}

/// Sources around `backbone`, with a vision tower when `vision` is given.
pub fn sources(backbone: &MemoryCheckpoint, vision: Option<&MemoryCheckpoint>) -> PipelineSources {
    PipelineSources {
        backbone_config: phi3_config(),
        multimodal: multimodal_config(),
        backbone: Box::new(backbone.clone()),
        tokenizer: Box::new(WordTokenizer::new()),
        vision: vision.map(|ckpt| VisionSources {
            config: clip_config(),
            preprocessor: PreProcessorConfig::square(28),
            checkpoint: Box::new(ckpt.clone()),
        }),
        hlora: None,
        fusion: None,
    }
}

/// A small non-square PNG.
pub fn png_bytes() -> Vec<u8> {
    let image = DynamicImage::from(RgbImage::from_fn(40, 24, |x, y| {
        Rgb([(x * 6) as u8, (y * 10) as u8, ((x + y) * 3) as u8])
    }));
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}
