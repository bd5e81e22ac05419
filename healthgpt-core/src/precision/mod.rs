use std::{collections::HashMap, fmt::Display, str::FromStr, sync::Arc};

use candle_core::{DType, Device, Tensor};
use healthgpt_lora::{ModuleKind, NamedParams, TargetModules};
use healthgpt_quant::{Int8Config, QuantizationBackend};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod checkpoint;
pub mod placement;

use checkpoint::{CheckpointSource, LoadTarget};
use placement::{PlacementAction, PlacementEvent, PlacementMachine, PlacementState};

use crate::{models::phi3::Model, utils::log::once_log_info, ConfigError, LoadError, PipelineError};

/// Numeric representation requested for the backbone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrecisionMode {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    Int8,
}

impl FromStr for PrecisionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FP32" | "F32" => Ok(Self::Fp32),
            "FP16" | "F16" => Ok(Self::Fp16),
            "BF16" => Ok(Self::Bf16),
            "INT8" => Ok(Self::Int8),
            _ => Err(ConfigError::UnsupportedPrecision(s.to_string())),
        }
    }
}

impl Display for PrecisionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fp32 => "FP32",
            Self::Fp16 => "FP16",
            Self::Bf16 => "BF16",
            Self::Int8 => "INT8",
        };
        write!(f, "{s}")
    }
}

/// What a [`PrecisionMode`] means for each part of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionProfile {
    pub mode: PrecisionMode,
    /// Backbone linear layers are held as 8-bit weights.
    pub quantized: bool,
    /// Dtype of every non-quantized tensor of the backbone and of the adapters.
    pub compute_dtype: DType,
}

impl PrecisionProfile {
    pub fn new(mode: PrecisionMode) -> Self {
        let (quantized, compute_dtype) = match mode {
            PrecisionMode::Fp32 => (false, DType::F32),
            PrecisionMode::Fp16 => (false, DType::F16),
            PrecisionMode::Bf16 => (false, DType::BF16),
            PrecisionMode::Int8 => (true, DType::F16),
        };
        Self {
            mode,
            quantized,
            compute_dtype,
        }
    }

    /// The vision tower and projector run in half precision under INT8.
    pub fn vision_dtype(&self) -> DType {
        if self.quantized {
            DType::F16
        } else {
            self.compute_dtype
        }
    }
}

/// Decides how the backbone is loaded and where every part of the model lives.
pub struct PrecisionManager {
    profile: PrecisionProfile,
    int8: Int8Config,
    device: Device,
    backend: Option<Arc<dyn QuantizationBackend>>,
}

impl PrecisionManager {
    /// Fails before anything is loaded when INT8 is requested without a quantization backend.
    pub fn new(
        mode: PrecisionMode,
        int8: Int8Config,
        device: Device,
        backend: Option<Arc<dyn QuantizationBackend>>,
    ) -> Result<Self, ConfigError> {
        let profile = PrecisionProfile::new(mode);
        if profile.quantized && backend.is_none() {
            return Err(ConfigError::QuantizationUnavailable);
        }
        Ok(Self {
            profile,
            int8,
            device,
            backend,
        })
    }

    pub fn profile(&self) -> &PrecisionProfile {
        &self.profile
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Load the backbone checkpoint onto the execution device at the compute dtype.
    ///
    /// Non-quantized modes retry once through host memory when the direct load is rejected
    /// as unsupported. Quantized loads are never retried.
    pub fn load_weights(
        &self,
        source: &dyn CheckpointSource,
    ) -> Result<(HashMap<String, Tensor>, PlacementState), PipelineError> {
        let dtype = self.profile.compute_dtype;
        let mut machine = PlacementMachine::new(self.profile.quantized);
        info!(
            "Loading `{}` in {} ({dtype:?}) on {:?}.",
            source.describe(),
            self.profile.mode,
            self.device
        );

        let direct = source.load(&LoadTarget::Direct(self.device.clone()), dtype);
        let err = match direct {
            Ok(weights) => {
                machine.transition(PlacementEvent::DirectLoaded);
                return Ok((weights, machine.state()));
            }
            Err(err) => err,
        };
        let event = match err {
            LoadError::UnsupportedPlacement { .. } => PlacementEvent::DirectRejected,
            _ => PlacementEvent::Errored,
        };
        if machine.transition(event) != PlacementAction::LoadOnHost {
            return Err(self.load_failure(err));
        }

        warn!("Direct placement rejected ({err}), loading through host memory.");
        let host = source
            .load(&LoadTarget::Host, dtype)
            .map_err(|e| self.load_failure(e))?;
        let mut weights = HashMap::with_capacity(host.len());
        // Consuming the host map frees each host copy as soon as its device copy exists.
        for (name, tensor) in host {
            let moved = tensor
                .to_device(&self.device)
                .map_err(|e| self.load_failure(LoadError::Candle(e)))?;
            weights.insert(name, moved);
        }
        self.release_device_cache();
        machine.transition(PlacementEvent::HostMoved);
        Ok((weights, machine.state()))
    }

    fn load_failure(&self, err: LoadError) -> PipelineError {
        if self.profile.quantized {
            PipelineError::QuantizedLoad(err)
        } else {
            PipelineError::Load(err)
        }
    }

    /// Replace every backbone linear projection with its 8-bit form. The output head is
    /// left in the compute dtype. Returns the number of layers quantized.
    pub fn quantize_backbone(&self, model: &mut Model) -> Result<usize, PipelineError> {
        let Some(backend) = self.backend.as_ref().filter(|_| self.profile.quantized) else {
            return Ok(0);
        };
        let targets = TargetModules::excluding(["lm_head"]);
        let mut count = 0;
        for (path, slot) in model.linear_slots_mut() {
            if !targets.matches(&path, ModuleKind::Linear) {
                continue;
            }
            let quantized = backend
                .quantize(&**slot.base().method(), &self.int8)
                .map_err(|e| PipelineError::QuantizedLoad(LoadError::Candle(e)))?;
            slot.replace_base(quantized);
            count += 1;
        }
        once_log_info(format!(
            "Quantized {count} linear layers with the {} backend (outlier threshold {}).",
            backend.name(),
            self.int8.threshold
        ));
        Ok(count)
    }

    /// Move `module` to the execution device at `dtype`. On failure the module keeps its
    /// previous placement and a warning is emitted.
    pub fn place_best_effort<T: NamedParams + Clone>(
        &self,
        module: &mut T,
        dtype: DType,
        what: &str,
    ) -> bool {
        let mut moved = module.clone();
        let device = &self.device;
        let res = moved.visit_params_mut(&mut |_, t| {
            *t = t.to_device(device)?.to_dtype(dtype)?;
            Ok(())
        });
        match res {
            Ok(()) => {
                *module = moved;
                debug!("Placed {what} on {device:?} as {dtype:?}.");
                true
            }
            Err(e) => {
                warn!("Could not place {what} on {device:?} as {dtype:?}, keeping it where it is: {e}");
                false
            }
        }
    }

    /// Best effort. A failure here never fails a load.
    pub fn release_device_cache(&self) {
        if let Err(e) = self.device.synchronize() {
            warn!("Could not release the device cache: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use healthgpt_quant::Int8Config;

    use super::{PrecisionManager, PrecisionMode, PrecisionProfile};
    use crate::ConfigError;

    #[test]
    fn parse_modes() {
        assert_eq!("fp16".parse::<PrecisionMode>().unwrap(), PrecisionMode::Fp16);
        assert_eq!("INT8".parse::<PrecisionMode>().unwrap(), PrecisionMode::Int8);
        assert!(matches!(
            "fp8".parse::<PrecisionMode>(),
            Err(ConfigError::UnsupportedPrecision(_))
        ));
    }

    #[test]
    fn int8_profile() {
        let p = PrecisionProfile::new(PrecisionMode::Int8);
        assert!(p.quantized);
        assert_eq!(p.compute_dtype, DType::F16);
        assert_eq!(p.vision_dtype(), DType::F16);
        assert_eq!(
            PrecisionProfile::new(PrecisionMode::Bf16).vision_dtype(),
            DType::BF16
        );
    }

    #[test]
    fn int8_without_backend_fails_fast() {
        assert!(matches!(
            PrecisionManager::new(PrecisionMode::Int8, Int8Config::default(), Device::Cpu, None),
            Err(ConfigError::QuantizationUnavailable)
        ));
        assert!(
            PrecisionManager::new(PrecisionMode::Fp16, Int8Config::default(), Device::Cpu, None)
                .is_ok()
        );
    }
}
