//! Inference orchestration for a medical vision-language assistant: precision and
//! placement, vocabulary extension, hierarchical LoRA adapters, vision fusion and
//! autoregressive generation over a Phi-3 style backbone.

use std::sync::atomic::AtomicBool;

mod config;
mod error;
pub mod models;
mod pipeline;
mod precision;
mod request;
mod tokenizer;
pub mod utils;
pub mod vision_models;
mod vocab;

pub use config::{PipelineConfig, RequestConfig, RunConfig};
pub use error::{ConfigError, LoadError, PipelineError, Result};
pub use healthgpt_lora::{
    AdapterSelector, CheckpointOverlay, HLoraConfig, ModuleKind, ModulePath, NamedParams,
    OverlayReport, TargetModules,
};
pub use healthgpt_quant::{int8_backend, Int8Config, QuantizationBackend};
pub use pipeline::{
    chat_template::{Conversation, ConversationTemplate, Role},
    generation::{GenerationOutput, GenerationParams, LanguageModel},
    inputs::tokenize_with_image,
    run_request, HealthGptPipeline, PipelineSources, VisionSources,
};
pub use precision::{
    checkpoint::{CheckpointSource, LoadTarget, SafetensorsCheckpoint},
    placement::{LeafPlacement, PlacementAction, PlacementEvent, PlacementMachine, PlacementState},
    PrecisionManager, PrecisionMode, PrecisionProfile,
};
pub use request::{InferenceRequest, ModelVariant, Task, TaskRouting};
pub use tokenizer::TextTokenizer;
pub use vocab::{
    vq_index_token, TokenEmbeddings, VocabularyExtension, IMAGE_END_TOKEN, IMAGE_START_TOKEN,
    IMAGE_TOKEN,
};

/// Set from `HEALTHGPT_DEBUG` when the logger is installed.
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);
