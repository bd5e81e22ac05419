use std::{fmt::Debug, sync::Arc};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::Module;
use serde::{Deserialize, Serialize};

#[cfg(feature = "int8")]
mod int8;
mod unquantized;

#[cfg(feature = "int8")]
pub use int8::{Int8Backend, Int8Linear};
pub use unquantized::UnquantLinear;

/// Outlier threshold used by LLM.int8 style mixed decomposition.
pub const DEFAULT_INT8_THRESHOLD: f64 = 6.0;

/// Parameters of the 8-bit weight quantization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Int8Config {
    /// Activation columns whose magnitude reaches this value are computed in full precision.
    #[serde(rename = "llm_int8_threshold")]
    pub threshold: f64,
    /// Keep a half precision copy of the weight for the outlier path.
    #[serde(rename = "llm_int8_has_fp16_weight")]
    pub has_fp16_weight: bool,
}

impl Default for Int8Config {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_INT8_THRESHOLD,
            has_fp16_weight: false,
        }
    }
}

/// A linear layer backend. The weight is held by the implementor, which may store it quantized.
pub trait QuantMethod: Send + Sync + Debug {
    /// Compute matmul of `self` and `a`. `self` should contain the weights.
    fn forward(&self, a: &Tensor) -> Result<Tensor>;

    /// Compute matmul of `self` and `a`, casting to the activation type the
    /// backend requires and back to the input dtype.
    fn forward_autocast(&self, a: &Tensor) -> Result<Tensor> {
        let original_ty = a.dtype();
        let a = if let Some(t) = self.quantized_act_type() {
            a.to_dtype(t)?
        } else {
            a.clone()
        };
        self.forward(&a)?.to_dtype(original_ty)
    }

    /// If a quantized method, return the activation dtype.
    fn quantized_act_type(&self) -> Option<DType>;

    /// Weight dtype and device
    fn dtype_and_device(&self) -> (DType, Device);

    /// `(out_features, in_features)`
    fn dims(&self) -> (usize, usize);

    fn is_quantized(&self) -> bool {
        self.quantized_act_type().is_some()
    }

    /// Full precision weight and bias, when the backend keeps them.
    fn unquant_weight_bias(&self) -> Option<(Tensor, Option<Tensor>)> {
        None
    }
}

impl Module for dyn QuantMethod {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Self::forward_autocast(self, xs)
    }
}

/// A capability which converts full precision linear layers into 8-bit ones.
pub trait QuantizationBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn quantize(&self, layer: &dyn QuantMethod, cfg: &Int8Config) -> Result<Arc<dyn QuantMethod>>;
}

/// The 8-bit quantization capability compiled into this build, if any.
#[cfg(feature = "int8")]
pub fn int8_backend() -> Option<Arc<dyn QuantizationBackend>> {
    Some(Arc::new(Int8Backend))
}

/// The 8-bit quantization capability compiled into this build, if any.
#[cfg(not(feature = "int8"))]
pub fn int8_backend() -> Option<Arc<dyn QuantizationBackend>> {
    None
}
