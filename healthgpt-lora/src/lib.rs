use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use candle_core::{DType, Shape};
use serde::{Deserialize, Serialize};
use tracing::info;

mod frozenlinear;
mod hloralinear;
mod overlay;
mod target;

pub use frozenlinear::FrozenLinear;
pub use hloralinear::{HLoraLinear, LinearSlot};
pub use overlay::{CheckpointOverlay, NamedParams, OverlayReport};
pub use target::{ModuleKind, ModulePath, TargetModules};

#[derive(Debug, thiserror::Error)]
pub enum LoraError {
    #[error("adapter index {index} is out of range, {nums} adapters are attached")]
    AdapterOutOfRange { index: usize, nums: usize },
    #[error("at least one adapter is required")]
    NoAdapters,
    #[error("selector covers {selector} adapters but {adapters} were requested")]
    SelectorMismatch { selector: usize, adapters: usize },
    #[error("`{name}` is already adapted")]
    AlreadyAdapted { name: String },
    #[error("checkpoint tensor `{name}` has shape {found:?}, the model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        found: Shape,
    },
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, LoraError>;

/// Hyperparameters shared by every adapter instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HLoraConfig {
    #[serde(rename = "r")]
    pub rank: usize,
    #[serde(rename = "lora_alpha")]
    pub alpha: f64,
    #[serde(rename = "lora_dropout", default)]
    pub dropout: f32,
    #[serde(rename = "lora_nums")]
    pub nums: usize,
}

impl Default for HLoraConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
            dropout: 0.0,
            nums: 4,
        }
    }
}

impl HLoraConfig {
    pub fn scale(&self) -> f64 {
        if self.rank > 0 {
            self.alpha / self.rank as f64
        } else {
            1.0
        }
    }
}

/// The active adapter index, shared by every adapted layer of one model.
///
/// Selecting an adapter is a single store, no adapter parameter is touched.
#[derive(Debug, Clone)]
pub struct AdapterSelector {
    active: Arc<AtomicUsize>,
    nums: usize,
}

impl AdapterSelector {
    pub fn new(nums: usize) -> Result<Self> {
        if nums == 0 {
            return Err(LoraError::NoAdapters);
        }
        Ok(Self {
            active: Arc::new(AtomicUsize::new(0)),
            nums,
        })
    }

    pub fn select(&self, index: usize) -> Result<()> {
        if index >= self.nums {
            return Err(LoraError::AdapterOutOfRange {
                index,
                nums: self.nums,
            });
        }
        self.active.store(index, Ordering::Release);
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn nums(&self) -> usize {
        self.nums
    }
}

/// Attach `cfg.nums` adapters to every linear slot accepted by `targets`.
/// Returns the number of slots adapted.
pub fn attach_adapters<'a>(
    slots: impl IntoIterator<Item = (ModulePath, &'a mut LinearSlot)>,
    targets: &TargetModules,
    cfg: &HLoraConfig,
    selector: &AdapterSelector,
    dtype: DType,
) -> Result<usize> {
    let mut count = 0;
    for (path, slot) in slots {
        if !targets.matches(&path, ModuleKind::Linear) {
            continue;
        }
        slot.attach(&path, cfg, selector.clone(), dtype)?;
        count += 1;
    }
    info!(
        "Attached {} adapters (r = {}, alpha = {}) to {count} linear layers.",
        cfg.nums, cfg.rank, cfg.alpha
    );
    Ok(count)
}
