use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// What the caller wants from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Comprehension: answer a question about an image.
    #[serde(rename = "Analyze Image", alias = "analyze")]
    Analyze,
    /// Generation: produce visual codebook tokens for an image.
    #[serde(rename = "Generate Image", alias = "generate")]
    Generate,
}

impl FromStr for Task {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analyze image" | "analyze" => Ok(Self::Analyze),
            "generate image" | "generate" => Ok(Self::Generate),
            _ => Err(ConfigError::UnknownTask(s.to_string())),
        }
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analyze => write!(f, "Analyze Image"),
            Self::Generate => write!(f, "Generate Image"),
        }
    }
}

/// Published model sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    #[default]
    #[serde(rename = "HealthGPT-M3")]
    M3,
    #[serde(rename = "HealthGPT-L14")]
    L14,
}

impl ModelVariant {
    /// Conversation template of the variant's language backbone.
    pub fn default_template(&self) -> &'static str {
        match self {
            Self::M3 => "phi3_instruct",
            Self::L14 => "phi4_instruct",
        }
    }
}

impl FromStr for ModelVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthgpt-m3" | "m3" => Ok(Self::M3),
            "healthgpt-l14" | "l14" => Ok(Self::L14),
            _ => Err(ConfigError::UnknownModelVariant(s.to_string())),
        }
    }
}

/// Which adapter serves each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRouting {
    pub analyze: usize,
    pub generate: usize,
}

impl Default for TaskRouting {
    fn default() -> Self {
        Self {
            analyze: 0,
            generate: 1,
        }
    }
}

impl TaskRouting {
    pub fn adapter_for(&self, task: Task) -> usize {
        match task {
            Task::Analyze => self.analyze,
            Task::Generate => self.generate,
        }
    }
}

/// One inference request.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub task: Task,
    pub model_variant: ModelVariant,
    pub question: String,
    /// Encoded image bytes (PNG, JPEG, ...).
    pub image: Option<Vec<u8>>,
    /// The task must see an image.
    pub visual_grounding: bool,
}

impl InferenceRequest {
    /// Analyze requests are visually grounded by default.
    pub fn new(task: Task, question: impl Into<String>) -> Self {
        Self {
            task,
            model_variant: ModelVariant::default(),
            question: question.into(),
            image: None,
            visual_grounding: task == Task::Analyze,
        }
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_variant(mut self, variant: ModelVariant) -> Self {
        self.model_variant = variant;
        self
    }

    /// Answer from text alone. Any attached image is dropped.
    pub fn text_only(mut self) -> Self {
        self.visual_grounding = false;
        self.image = None;
        self
    }

    /// Checks that need no weights, run before anything is loaded.
    pub fn validate(&self, vision_available: bool) -> Result<(), ConfigError> {
        if self.visual_grounding && self.image.is_none() {
            return Err(ConfigError::MissingImage(self.task));
        }
        if self.image.is_some() && !vision_available {
            return Err(ConfigError::VisionTowerMissing);
        }
        Ok(())
    }
}
