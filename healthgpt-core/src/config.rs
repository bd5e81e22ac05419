use std::path::{Path, PathBuf};

use healthgpt_lora::HLoraConfig;
use healthgpt_quant::Int8Config;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    pipeline::{chat_template::ConversationTemplate, generation::GenerationParams},
    precision::PrecisionMode,
    request::{InferenceRequest, ModelVariant, Task, TaskRouting},
    ConfigError, LoadError, PipelineError,
};

fn default_vq_idx_nums() -> usize {
    1024
}

fn default_task() -> String {
    Task::Analyze.to_string()
}

/// Everything needed to load a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Backbone directory: `config.json`, `tokenizer.json` and weight files.
    pub model_name_or_path: PathBuf,

    /// `FP32`, `FP16`, `BF16` or `INT8`.
    #[serde(default)]
    pub dtype: PrecisionMode,

    #[serde(default)]
    pub hlora: HLoraConfig,

    /// Size of the visual codebook vocabulary.
    #[serde(default = "default_vq_idx_nums")]
    pub vq_idx_nums: usize,

    /// Conversation template. Defaults to the one of the requested model variant.
    #[serde(default)]
    pub instruct_template: Option<String>,

    /// CLIP vision tower directory. Without it only text-only requests can be served.
    #[serde(default)]
    pub vit_path: Option<PathBuf>,

    /// Adapter weights, overlaid by parameter name.
    #[serde(default)]
    pub hlora_path: Option<PathBuf>,

    /// Projector weights, overlaid by parameter name.
    #[serde(default)]
    pub fusion_layer_path: Option<PathBuf>,

    #[serde(default)]
    pub routing: TaskRouting,

    #[serde(default)]
    pub int8: Int8Config,

    /// Run on the host even when an accelerator is available.
    #[serde(default)]
    pub cpu: bool,
}

impl PipelineConfig {
    pub fn new(model_name_or_path: impl Into<PathBuf>) -> Self {
        Self {
            model_name_or_path: model_name_or_path.into(),
            dtype: PrecisionMode::default(),
            hlora: HLoraConfig::default(),
            vq_idx_nums: default_vq_idx_nums(),
            instruct_template: None,
            vit_path: None,
            hlora_path: None,
            fusion_layer_path: None,
            routing: TaskRouting::default(),
            int8: Int8Config::default(),
            cpu: false,
        }
    }

    /// Checks that need no weights.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hlora.nums == 0 {
            return Err(ConfigError::Invalid {
                name: "hlora_nums",
                reason: "at least one adapter is required".to_string(),
            });
        }
        if self.hlora.rank == 0 {
            return Err(ConfigError::Invalid {
                name: "hlora_r",
                reason: "the adapter rank must be positive".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.hlora.dropout) {
            return Err(ConfigError::Invalid {
                name: "hlora_dropout",
                reason: format!("{} is outside [0, 1)", self.hlora.dropout),
            });
        }
        for task in [Task::Analyze, Task::Generate] {
            let index = self.routing.adapter_for(task);
            if index >= self.hlora.nums {
                return Err(ConfigError::AdapterOutOfRange {
                    task,
                    index,
                    nums: self.hlora.nums,
                });
            }
        }
        if let Some(name) = &self.instruct_template {
            ConversationTemplate::by_name(name)?;
        }
        Ok(())
    }

    /// The configured template, or the variant's own.
    pub fn template_for(&self, variant: ModelVariant) -> Result<&'static ConversationTemplate, ConfigError> {
        let name = self
            .instruct_template
            .as_deref()
            .unwrap_or(variant.default_template());
        ConversationTemplate::by_name(name)
    }
}

/// A request as written in a TOML run file or given on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// `Analyze Image` or `Generate Image`.
    #[serde(default = "default_task")]
    pub task: String,
    /// `HealthGPT-M3` or `HealthGPT-L14`.
    #[serde(default)]
    pub model_variant: Option<String>,
    pub question: String,
    #[serde(default)]
    pub img_path: Option<PathBuf>,
    /// Answer without an image even for analysis.
    #[serde(default)]
    pub text_only: bool,
}

impl RequestConfig {
    /// Parse the labels and read the image file.
    pub fn to_request(&self) -> Result<InferenceRequest, PipelineError> {
        let mut request = InferenceRequest::new(self.task.parse()?, self.question.clone());
        if let Some(variant) = &self.model_variant {
            request = request.with_variant(variant.parse()?);
        }
        if self.text_only {
            if let Some(path) = &self.img_path {
                warn!("Text-only request, ignoring `{}`.", path.display());
            }
            return Ok(request.text_only());
        }
        if let Some(path) = &self.img_path {
            let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })?;
            request = request.with_image(bytes);
        }
        Ok(request)
    }
}

/// A complete run: pipeline, decoding options and one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub generation: GenerationParams,
    pub request: RequestConfig,
}

impl RunConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, LoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| LoadError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}
