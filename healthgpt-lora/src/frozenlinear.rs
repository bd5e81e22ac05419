use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use healthgpt_quant::{QuantMethod, UnquantLinear};

/// Linear, but frozen: weights and biases are detached and only read.
/// The backing storage may be quantized.
#[derive(Debug, Clone)]
pub struct FrozenLinear {
    inner: Arc<dyn QuantMethod>,
}

impl FrozenLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            inner: Arc::new(UnquantLinear::new(weight, bias)),
        }
    }

    pub fn from_method(inner: Arc<dyn QuantMethod>) -> Self {
        Self { inner }
    }

    pub fn method(&self) -> &Arc<dyn QuantMethod> {
        &self.inner
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.inner.forward_autocast(x)
    }

    pub fn dims(&self) -> (usize, usize) {
        self.inner.dims()
    }

    pub fn dtype_and_device(&self) -> (DType, Device) {
        self.inner.dtype_and_device()
    }

    pub fn is_quantized(&self) -> bool {
        self.inner.is_quantized()
    }
}
