use std::sync::Arc;

use candle_core::{DType, Module, Tensor};
use candle_nn::{init, Dropout, Linear};
use healthgpt_quant::{QuantMethod, UnquantLinear};

use crate::{
    frozenlinear::FrozenLinear, AdapterSelector, HLoraConfig, LoraError, ModulePath, Result,
};

/// A frozen linear layer carrying `nums` independent low-rank adapters.
///
/// Only the adapter picked by the shared [`AdapterSelector`] contributes:
/// `y = base(x) + scale * B_k A_k x`.
#[derive(Debug)]
pub struct HLoraLinear {
    base: FrozenLinear,
    a_adapters: Vec<Tensor>,
    b_adapters: Vec<Tensor>,
    scale: f64,
    dropout: Option<Dropout>,
    selector: AdapterSelector,
}

impl HLoraLinear {
    pub fn new(
        base: FrozenLinear,
        cfg: &HLoraConfig,
        selector: AdapterSelector,
        dtype: DType,
    ) -> Result<Self> {
        if cfg.nums == 0 {
            return Err(LoraError::NoAdapters);
        }
        if selector.nums() != cfg.nums {
            return Err(LoraError::SelectorMismatch {
                selector: selector.nums(),
                adapters: cfg.nums,
            });
        }
        let (out_features, in_features) = base.dims();
        let (_, device) = base.dtype_and_device();
        let mut a_adapters = Vec::with_capacity(cfg.nums);
        let mut b_adapters = Vec::with_capacity(cfg.nums);
        for _ in 0..cfg.nums {
            let a = init::DEFAULT_KAIMING_NORMAL
                .var((cfg.rank, in_features), DType::F32, &device)?
                .as_tensor()
                .to_dtype(dtype)?;
            let b = Tensor::zeros((out_features, cfg.rank), dtype, &device)?;
            a_adapters.push(a);
            b_adapters.push(b);
        }
        let dropout = (cfg.dropout > 0.0).then(|| Dropout::new(cfg.dropout));
        Ok(Self {
            base,
            a_adapters,
            b_adapters,
            scale: cfg.scale(),
            dropout,
            selector,
        })
    }

    pub fn base(&self) -> &FrozenLinear {
        &self.base
    }

    pub fn nums(&self) -> usize {
        self.a_adapters.len()
    }

    /// `(A_k, B_k)` of one adapter.
    pub fn adapter(&self, k: usize) -> Option<(&Tensor, &Tensor)> {
        Some((self.a_adapters.get(k)?, self.b_adapters.get(k)?))
    }

    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let result = self.base.forward(x)?;
        let k = self.selector.active();
        let (Some(a), Some(b)) = (self.a_adapters.get(k), self.b_adapters.get(k)) else {
            candle_core::bail!("active adapter {k} is not attached to this layer");
        };
        let xs = x.to_dtype(a.dtype())?;
        let xs = match &self.dropout {
            // Dropout is a no-op outside of training.
            Some(dropout) => dropout.forward(&xs, false)?,
            None => xs,
        };
        let delta = Linear::new(b.clone(), None)
            .forward(&Linear::new(a.clone(), None).forward(&xs)?)?;
        let delta = (delta * self.scale)?.to_dtype(result.dtype())?;
        result + delta
    }
}

/// A linear projection of the backbone: either frozen only, or frozen with adapters.
#[derive(Debug)]
pub enum LinearSlot {
    Frozen(FrozenLinear),
    HLora(HLoraLinear),
}

impl LinearSlot {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self::Frozen(FrozenLinear::new(weight, bias))
    }

    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Frozen(base) => base.forward(x),
            Self::HLora(lora) => lora.forward(x),
        }
    }

    pub fn base(&self) -> &FrozenLinear {
        match self {
            Self::Frozen(base) => base,
            Self::HLora(lora) => &lora.base,
        }
    }

    pub fn as_hlora(&self) -> Option<&HLoraLinear> {
        match self {
            Self::Frozen(_) => None,
            Self::HLora(lora) => Some(lora),
        }
    }

    /// Swap the frozen weight storage, keeping any attached adapters.
    pub fn replace_base(&mut self, method: Arc<dyn QuantMethod>) {
        let base = FrozenLinear::from_method(method);
        match self {
            Self::Frozen(old) => *old = base,
            Self::HLora(lora) => lora.base = base,
        }
    }

    pub fn attach(
        &mut self,
        path: &ModulePath,
        cfg: &HLoraConfig,
        selector: AdapterSelector,
        dtype: DType,
    ) -> Result<()> {
        let Self::Frozen(base) = self else {
            return Err(LoraError::AlreadyAdapted {
                name: path.to_string(),
            });
        };
        *self = Self::HLora(HLoraLinear::new(base.clone(), cfg, selector, dtype)?);
        Ok(())
    }

    /// Visit every plain tensor owned by this slot under its dotted name.
    /// Quantized base weights are not visited.
    pub fn visit_params_mut(
        &mut self,
        path: &ModulePath,
        f: &mut dyn FnMut(&str, &mut Tensor) -> candle_core::Result<()>,
    ) -> candle_core::Result<()> {
        let base = match self {
            Self::Frozen(base) => base,
            Self::HLora(lora) => {
                for (k, (a, b)) in lora
                    .a_adapters
                    .iter_mut()
                    .zip(lora.b_adapters.iter_mut())
                    .enumerate()
                {
                    f(&path.param(&format!("lora_A.{k}.weight")), a)?;
                    f(&path.param(&format!("lora_B.{k}.weight")), b)?;
                }
                &mut lora.base
            }
        };
        if let Some((mut weight, mut bias)) = base.method().unquant_weight_bias() {
            f(&path.param("weight"), &mut weight)?;
            if let Some(bias) = bias.as_mut() {
                f(&path.param("bias"), bias)?;
            }
            *base = FrozenLinear::from_method(Arc::new(UnquantLinear::new(weight, bias)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::LinearSlot;
    use crate::{AdapterSelector, HLoraConfig, ModulePath};

    fn adapted(nums: usize) -> (LinearSlot, AdapterSelector) {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1.0, (6, 8), &dev).unwrap();
        let mut slot = LinearSlot::new(w, None);
        let sel = AdapterSelector::new(nums).unwrap();
        let cfg = HLoraConfig {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
            nums,
        };
        slot.attach(&ModulePath::from("proj"), &cfg, sel.clone(), DType::F32)
            .unwrap();
        (slot, sel)
    }

    #[test]
    fn untrained_adapters_contribute_nothing() {
        let (slot, sel) = adapted(3);
        let x = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
        let base = slot.base().forward(&x).unwrap();
        for k in 0..3 {
            sel.select(k).unwrap();
            let y = slot.forward(&x).unwrap();
            let diff = (y - &base).unwrap().abs().unwrap().sum_all().unwrap();
            assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        }
    }

    #[test]
    fn only_selected_adapter_applies() {
        let (mut slot, sel) = adapted(2);
        slot.visit_params_mut(&ModulePath::from("proj"), &mut |name, t| {
            if name == "proj.lora_B.1.weight" {
                *t = t.ones_like()?;
            }
            Ok(())
        })
        .unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 1, 8), &Device::Cpu).unwrap();
        let base = slot.base().forward(&x).unwrap();

        sel.select(0).unwrap();
        let y0 = slot.forward(&x).unwrap();
        assert_eq!(
            y0.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            base.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );

        sel.select(1).unwrap();
        let y1 = slot.forward(&x).unwrap();
        let diff = (y1 - &base).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn visits_base_and_adapter_names() {
        let (mut slot, _) = adapted(2);
        let mut names = Vec::new();
        slot.visit_params_mut(&ModulePath::from("m.q"), &mut |name, _| {
            names.push(name.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            names,
            vec![
                "m.q.lora_A.0.weight",
                "m.q.lora_B.0.weight",
                "m.q.lora_A.1.weight",
                "m.q.lora_B.1.weight",
                "m.q.weight",
            ]
        );
        assert!(slot
            .attach(
                &ModulePath::from("m.q"),
                &HLoraConfig::default(),
                AdapterSelector::new(4).unwrap(),
                DType::F32
            )
            .is_err());
    }
}
