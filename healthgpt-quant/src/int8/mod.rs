use std::sync::Arc;

use candle_core::{
    bail,
    quantized::{GgmlDType, QMatMul, QTensor},
    DType, Device, Module, Result, Tensor,
};
use tracing::debug;

use crate::{Int8Config, QuantMethod, QuantizationBackend};

/// 8-bit linear layer with mixed precision outlier handling.
///
/// Weights are stored as Q8_0 blocks. At forward time every activation column whose
/// absolute maximum reaches `threshold` is routed through a full precision matmul against
/// the dequantized (or retained half precision) weight, the remaining columns go through
/// the 8-bit kernel. The two partial products are summed.
#[derive(Debug)]
pub struct Int8Linear {
    w: QMatMul,
    fp_w: Option<Tensor>,
    b: Option<Tensor>,
    threshold: f64,
    dims: (usize, usize),
    device: Device,
}

impl Int8Linear {
    pub fn quantize(weight: &Tensor, bias: Option<&Tensor>, cfg: &Int8Config) -> Result<Self> {
        let (out_dim, in_dim) = weight.dims2()?;
        let block = GgmlDType::Q8_0.block_size();
        if in_dim % block != 0 {
            bail!("cannot quantize a linear layer with {in_dim} input features to int8, must be a multiple of {block}");
        }
        let device = weight.device().clone();
        let q = QTensor::quantize(&weight.to_dtype(DType::F32)?, GgmlDType::Q8_0)?;
        let fp_w = if cfg.has_fp16_weight {
            Some(weight.to_dtype(DType::F16)?)
        } else {
            None
        };
        let b = match bias {
            Some(b) => Some(b.to_dtype(DType::F32)?),
            None => None,
        };
        Ok(Self {
            w: QMatMul::QTensor(Arc::new(q)),
            fp_w,
            b,
            threshold: cfg.threshold,
            dims: (out_dim, in_dim),
            device,
        })
    }

    fn outlier_weight(&self) -> Result<Tensor> {
        if let Some(w) = &self.fp_w {
            return w.to_dtype(DType::F32);
        }
        match &self.w {
            QMatMul::QTensor(q) => q.dequantize(&self.device),
            QMatMul::Tensor(t) | QMatMul::TensorF16(t) => t.to_dtype(DType::F32),
        }
    }

    /// Mask over input features, 1.0 where the column holds an outlier.
    fn outlier_mask(&self, a: &Tensor) -> Result<(Tensor, usize)> {
        let flat = a.reshape(((), self.dims.1))?;
        let mask = flat.abs()?.max(0)?.ge(self.threshold)?.to_dtype(a.dtype())?;
        let count = mask.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()? as usize;
        Ok((mask, count))
    }
}

impl QuantMethod for Int8Linear {
    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        let (mask, n_outliers) = self.outlier_mask(a)?;
        let x = if n_outliers == 0 {
            self.w.forward(a)?
        } else {
            debug!("int8 matmul with {n_outliers} outlier columns");
            let regular = a.broadcast_mul(&mask.affine(-1.0, 1.0)?)?;
            let outliers = a.broadcast_mul(&mask)?;
            let quantized = self.w.forward(&regular)?;
            let full = outliers.broadcast_matmul(&self.outlier_weight()?.t()?)?;
            (quantized + full)?
        };
        if let Some(ref b) = self.b {
            x.broadcast_add(b)
        } else {
            Ok(x)
        }
    }

    fn quantized_act_type(&self) -> Option<DType> {
        Some(DType::F32)
    }

    fn dtype_and_device(&self) -> (DType, Device) {
        (DType::F32, self.device.clone())
    }

    fn dims(&self) -> (usize, usize) {
        self.dims
    }
}

/// Quantizes full precision linear layers to [`Int8Linear`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Int8Backend;

impl QuantizationBackend for Int8Backend {
    fn name(&self) -> &'static str {
        "int8"
    }

    fn quantize(&self, layer: &dyn QuantMethod, cfg: &Int8Config) -> Result<Arc<dyn QuantMethod>> {
        let Some((w, b)) = layer.unquant_weight_bias() else {
            bail!("layer is already quantized");
        };
        Ok(Arc::new(Int8Linear::quantize(&w, b.as_ref(), cfg)?))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor, D};

    use super::{Int8Backend, Int8Linear};
    use crate::{Int8Config, QuantMethod, QuantizationBackend, UnquantLinear};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(D::Minus1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn close_to_full_precision() {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 0.05, (16, 64), &dev).unwrap();
        let x = Tensor::randn(0f32, 0.5, (1, 3, 64), &dev).unwrap();
        let reference = UnquantLinear::new(w.clone(), None).forward(&x).unwrap();
        let q = Int8Linear::quantize(&w, None, &Int8Config::default()).unwrap();
        let out = q.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 3, 16]);
        assert!(max_abs_diff(&reference, &out) < 0.05);
    }

    #[test]
    fn outlier_columns_take_full_precision_path() {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 0.05, (8, 32), &dev).unwrap();
        // column 0 far above the threshold
        let mut data = vec![0.1f32; 32];
        data[0] = 50.0;
        let x = Tensor::from_vec(data, (1, 1, 32), &dev).unwrap();
        let cfg = Int8Config::default();
        let q = Int8Linear::quantize(&w, None, &cfg).unwrap();
        let (_, n) = q.outlier_mask(&x).unwrap();
        assert_eq!(n, 1);
        let reference = UnquantLinear::new(w, None).forward(&x).unwrap();
        let out = q.forward(&x).unwrap();
        assert!(max_abs_diff(&reference, &out) < 0.5);
    }

    #[test]
    fn rejects_unaligned_inputs() {
        let w = Tensor::zeros((4, 20), DType::F32, &Device::Cpu).unwrap();
        assert!(Int8Linear::quantize(&w, None, &Int8Config::default()).is_err());
    }

    #[test]
    fn backend_refuses_quantized_input() {
        let w = Tensor::zeros((4, 32), DType::F32, &Device::Cpu).unwrap();
        let cfg = Int8Config::default();
        let q = Int8Backend
            .quantize(&UnquantLinear::new(w, None), &cfg)
            .unwrap();
        assert!(q.is_quantized());
        assert!(Int8Backend.quantize(&*q, &cfg).is_err());
    }
}
