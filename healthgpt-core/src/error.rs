use std::path::PathBuf;

use healthgpt_lora::LoraError;

use crate::request::Task;

/// Caller configuration problems. Always reported before any device work and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("INT8 precision needs an 8-bit quantization capability and none is available in this build (enable the `int8` feature)")]
    QuantizationUnavailable,
    #[error("unsupported precision `{0}`, expected one of FP32, FP16, BF16, INT8")]
    UnsupportedPrecision(String),
    #[error("`{0}` requests visual grounding but no image was supplied")]
    MissingImage(Task),
    #[error("an image was supplied but no vision tower is configured")]
    VisionTowerMissing,
    #[error("unknown conversation template `{0}`")]
    UnknownTemplate(String),
    #[error("unknown task `{0}`, expected `Analyze Image` or `Generate Image`")]
    UnknownTask(String),
    #[error("unknown model variant `{0}`, expected `HealthGPT-M3` or `HealthGPT-L14`")]
    UnknownModelVariant(String),
    #[error("the prompt holds {0} image placeholders, expected one per supplied image")]
    PlaceholderCount(usize),
    #[error("`{task}` routes to adapter {index}, but only {nums} adapters are attached")]
    AdapterOutOfRange { task: Task, index: usize, nums: usize },
    #[error("invalid setting `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Weight loading and placement failures.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The load path rejected the requested device or dtype. The only trigger of the host fallback.
    #[error("direct placement on {device} is not supported: {reason}")]
    UnsupportedPlacement { device: String, reason: String },
    #[error("no checkpoint files found at `{0}`")]
    MissingCheckpoint(PathBuf),
    #[error("no checkpoint provided these projector weights: {}", missing.join(", "))]
    MissingProjectorWeights { missing: Vec<String> },
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse `{path}`: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse `{path}`: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Overlay(#[from] LoraError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("load error: {0}")]
    Load(#[from] LoadError),
    /// Quantized loading is never retried without quantization.
    #[error("INT8 load failed: {0}")]
    QuantizedLoad(#[source] LoadError),
    #[error("generation failed: {0}")]
    Generation(#[source] candle_core::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("malformed image: {0}")]
    Image(#[from] image::ImageError),
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl PipelineError {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<LoraError> for PipelineError {
    fn from(value: LoraError) -> Self {
        Self::Load(LoadError::Overlay(value))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
