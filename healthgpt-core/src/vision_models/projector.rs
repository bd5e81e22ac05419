use std::str::FromStr;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use healthgpt_lora::{ModulePath, NamedParams};

/// Layout of the multimodal projector, as named by `mm_projector_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorKind {
    Linear,
    /// `depth` linear layers with GELU in between.
    MlpGelu { depth: usize },
}

impl FromStr for ProjectorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "linear" {
            return Ok(Self::Linear);
        }
        s.strip_prefix("mlp")
            .and_then(|rest| rest.strip_suffix("x_gelu"))
            .and_then(|depth| depth.parse().ok())
            .filter(|&depth| depth > 0)
            .map(|depth| Self::MlpGelu { depth })
            .ok_or_else(|| format!("unsupported projector type `{s}`"))
    }
}

/// Maps vision features into the language model's hidden size.
///
/// Weights start from a Kaiming initialization and are expected to be overwritten from a
/// checkpoint.
#[derive(Debug, Clone)]
pub struct MmProjector {
    kind: ProjectorKind,
    layers: Vec<(Tensor, Tensor)>,
}

impl MmProjector {
    pub const PREFIX: &'static str = "model.mm_projector";

    pub fn new(
        kind: ProjectorKind,
        vision_hidden: usize,
        text_hidden: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let depth = match kind {
            ProjectorKind::Linear => 1,
            ProjectorKind::MlpGelu { depth } => depth,
        };
        let layers = (0..depth)
            .map(|i| {
                let in_dim = if i == 0 { vision_hidden } else { text_hidden };
                let w = DEFAULT_KAIMING_NORMAL
                    .var((text_hidden, in_dim), DType::F32, device)?
                    .as_tensor()
                    .to_dtype(dtype)?;
                let b = Tensor::zeros(text_hidden, dtype, device)?;
                Ok((w, b))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { kind, layers })
    }

    pub fn kind(&self) -> ProjectorKind {
        self.kind
    }

    fn layer_path(&self, i: usize) -> ModulePath {
        let root = ModulePath::from(Self::PREFIX);
        match self.kind {
            ProjectorKind::Linear => root,
            // nn.Sequential(Linear, GELU, Linear, ...): linear layers sit at even indices.
            ProjectorKind::MlpGelu { .. } => root.join(2 * i),
        }
    }
}

impl Module for MmProjector {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, (w, b)) in self.layers.iter().enumerate() {
            if i > 0 {
                xs = xs.gelu_erf()?;
            }
            xs = candle_nn::Linear::new(w.clone(), Some(b.clone()))
                .forward(&xs.to_dtype(w.dtype())?)?;
        }
        Ok(xs)
    }
}

impl NamedParams for MmProjector {
    fn visit_params_mut(
        &mut self,
        f: &mut dyn FnMut(&str, &mut Tensor) -> Result<()>,
    ) -> Result<()> {
        let paths: Vec<ModulePath> = (0..self.layers.len()).map(|i| self.layer_path(i)).collect();
        for (path, (w, b)) in paths.iter().zip(self.layers.iter_mut()) {
            f(&path.param("weight"), w)?;
            f(&path.param("bias"), b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Module, Tensor};
    use healthgpt_lora::NamedParams;

    use super::{MmProjector, ProjectorKind};

    #[test]
    fn parses_kinds() {
        assert_eq!(
            "mlp2x_gelu".parse::<ProjectorKind>().unwrap(),
            ProjectorKind::MlpGelu { depth: 2 }
        );
        assert_eq!("linear".parse::<ProjectorKind>().unwrap(), ProjectorKind::Linear);
        assert!("identity".parse::<ProjectorKind>().is_err());
    }

    #[test]
    fn sequential_names_and_shapes() {
        let mut p = MmProjector::new(
            ProjectorKind::MlpGelu { depth: 2 },
            8,
            16,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        let mut names = Vec::new();
        p.visit_params_mut(&mut |n, _| {
            names.push(n.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            names,
            vec![
                "model.mm_projector.0.weight",
                "model.mm_projector.0.bias",
                "model.mm_projector.2.weight",
                "model.mm_projector.2.bias",
            ]
        );
        let x = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(p.forward(&x).unwrap().dims(), &[1, 4, 16]);
    }
}
