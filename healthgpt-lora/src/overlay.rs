use std::collections::{BTreeSet, HashMap};

use candle_core::Tensor;
use regex::Regex;
use tracing::{info, warn};

use crate::{LoraError, Result};

/// A module graph whose plain tensors can be enumerated by dotted name and replaced.
pub trait NamedParams {
    fn visit_params_mut(
        &mut self,
        f: &mut dyn FnMut(&str, &mut Tensor) -> candle_core::Result<()>,
    ) -> candle_core::Result<()>;
}

/// Outcome of overlaying a partial checkpoint.
#[derive(Debug, Default, Clone)]
pub struct OverlayReport {
    /// Parameters which received a tensor from the checkpoint.
    pub matched: Vec<String>,
    /// Checkpoint module groups that matched nothing, sorted.
    pub unmatched_groups: Vec<String>,
    /// Adapter indices that received at least one tensor.
    pub adapters_loaded: BTreeSet<usize>,
    /// Adapter indices left in their initial state while others were loaded.
    pub adapters_untouched: BTreeSet<usize>,
}

impl OverlayReport {
    pub fn warnings(&self) -> usize {
        self.unmatched_groups.len() + self.adapters_untouched.len()
    }

    /// The names in `expected` that no checkpoint supplied.
    pub fn missing<S: AsRef<str>>(&self, expected: &[S]) -> Vec<String> {
        expected
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !self.matched.iter().any(|m| m == name))
            .map(str::to_string)
            .collect()
    }

    pub fn merge(&mut self, other: OverlayReport) {
        self.matched.extend(other.matched);
        self.unmatched_groups.extend(other.unmatched_groups);
        self.adapters_loaded.extend(other.adapters_loaded);
        self.adapters_untouched = self
            .adapters_untouched
            .union(&other.adapters_untouched)
            .filter(|k| !self.adapters_loaded.contains(k))
            .copied()
            .collect();
    }
}

/// Overlays checkpoint tensors onto a model by parameter name.
///
/// Names are canonicalized first: the `base_model.model.` wrapper prefix is dropped and
/// fused adapter indices such as `lora_A3.` are split into `lora_A.3.`.
pub struct CheckpointOverlay {
    fused_index: Regex,
    adapter_index: Regex,
    group_suffix: Regex,
}

impl CheckpointOverlay {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fused_index: Regex::new(r"lora_([AB])(\d+)\.")?,
            adapter_index: Regex::new(r"\.lora_[AB]\.(\d+)\.")?,
            group_suffix: Regex::new(r"(\.lora_[AB]\.\d+)?\.(weight|bias)$")?,
        })
    }

    pub fn canonical_name(&self, name: &str) -> String {
        let name = name.strip_prefix("base_model.model.").unwrap_or(name);
        self.fused_index
            .replace_all(name, "lora_${1}.${2}.")
            .into_owned()
    }

    fn adapter_of(&self, name: &str) -> Option<usize> {
        self.adapter_index
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn group_of(&self, name: &str) -> String {
        self.group_suffix.replace(name, "").into_owned()
    }

    /// Replace every parameter of `target` named in `tensors`.
    ///
    /// Entries naming nothing in `target` are reported and warned about once per module
    /// group. An entry whose name matches but whose shape differs is an error.
    pub fn apply(
        &self,
        target: &mut dyn NamedParams,
        tensors: HashMap<String, Tensor>,
        adapter_nums: usize,
    ) -> Result<OverlayReport> {
        let mut pending: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(name, t)| (self.canonical_name(&name), t))
            .collect();
        let mut report = OverlayReport::default();
        let mut mismatch = None;
        target.visit_params_mut(&mut |name, slot| {
            let Some(src) = pending.remove(name) else {
                return Ok(());
            };
            if src.shape() != slot.shape() {
                mismatch.get_or_insert(LoraError::ShapeMismatch {
                    name: name.to_string(),
                    expected: slot.shape().clone(),
                    found: src.shape().clone(),
                });
                return Ok(());
            }
            *slot = src.to_device(slot.device())?.to_dtype(slot.dtype())?;
            report.matched.push(name.to_string());
            Ok(())
        })?;
        if let Some(err) = mismatch {
            return Err(err);
        }

        let groups: BTreeSet<String> = pending.keys().map(|n| self.group_of(n)).collect();
        for group in &groups {
            warn!("Checkpoint entries under `{group}` match no parameter of the model, skipping them.");
        }
        report.unmatched_groups = groups.into_iter().collect();

        report.adapters_loaded = report
            .matched
            .iter()
            .filter_map(|n| self.adapter_of(n))
            .collect();
        if !report.adapters_loaded.is_empty() {
            report.adapters_untouched = (0..adapter_nums)
                .filter(|k| !report.adapters_loaded.contains(k))
                .collect();
            for k in &report.adapters_untouched {
                warn!("Adapter {k} received no weights and keeps its initial state.");
            }
        }
        info!(
            "Overlaid {} tensors, {} unmatched groups.",
            report.matched.len(),
            report.unmatched_groups.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use super::{CheckpointOverlay, NamedParams};
    use crate::{AdapterSelector, HLoraConfig, LinearSlot, LoraError, ModulePath};

    struct TwoLayers {
        slots: Vec<(ModulePath, LinearSlot)>,
    }

    impl NamedParams for TwoLayers {
        fn visit_params_mut(
            &mut self,
            f: &mut dyn FnMut(&str, &mut Tensor) -> candle_core::Result<()>,
        ) -> candle_core::Result<()> {
            for (path, slot) in &mut self.slots {
                slot.visit_params_mut(path, f)?;
            }
            Ok(())
        }
    }

    fn model(nums: usize) -> TwoLayers {
        let dev = Device::Cpu;
        let cfg = HLoraConfig {
            rank: 2,
            alpha: 2.0,
            dropout: 0.0,
            nums,
        };
        let sel = AdapterSelector::new(nums).unwrap();
        let mut slots = Vec::new();
        for i in 0..2 {
            let path = ModulePath::from(format!("model.layers.{i}.o_proj").as_str());
            let mut slot = LinearSlot::new(Tensor::ones((4, 4), DType::F32, &dev).unwrap(), None);
            slot.attach(&path, &cfg, sel.clone(), DType::F32).unwrap();
            slots.push((path, slot));
        }
        TwoLayers { slots }
    }

    #[test]
    fn canonical_names() {
        let o = CheckpointOverlay::new().unwrap();
        assert_eq!(
            o.canonical_name("base_model.model.model.layers.0.o_proj.lora_A2.weight"),
            "model.layers.0.o_proj.lora_A.2.weight"
        );
        assert_eq!(
            o.canonical_name("model.mm_projector.0.weight"),
            "model.mm_projector.0.weight"
        );
    }

    #[test]
    fn partial_checkpoint_loads_only_adapter_zero() {
        let mut m = model(3);
        let o = CheckpointOverlay::new().unwrap();
        let dev = Device::Cpu;
        let mut ckpt = HashMap::new();
        for i in 0..2 {
            ckpt.insert(
                format!("base_model.model.model.layers.{i}.o_proj.lora_B0.weight"),
                Tensor::full(0.5f32, (4, 2), &dev).unwrap(),
            );
        }
        ckpt.insert(
            "model.vision_resampler.fc.weight".to_string(),
            Tensor::zeros(3, DType::F32, &dev).unwrap(),
        );
        let report = o.apply(&mut m, ckpt, 3).unwrap();
        assert_eq!(report.matched.len(), 2);
        assert_eq!(report.adapters_loaded.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(
            report.adapters_untouched.iter().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(report.unmatched_groups, vec!["model.vision_resampler.fc"]);
        assert_eq!(report.warnings(), 3);

        let lora = m.slots[0].1.as_hlora().unwrap();
        let (_, b0) = lora.adapter(0).unwrap();
        assert_eq!(b0.sum_all().unwrap().to_scalar::<f32>().unwrap(), 4.0);
        for k in 1..3 {
            let (_, bk) = lora.adapter(k).unwrap();
            assert_eq!(bk.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
        }
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let mut m = model(2);
        let o = CheckpointOverlay::new().unwrap();
        let mut ckpt = HashMap::new();
        ckpt.insert(
            "model.layers.0.o_proj.weight".to_string(),
            Tensor::zeros((5, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            o.apply(&mut m, ckpt, 2),
            Err(LoraError::ShapeMismatch { .. })
        ));
    }
}
