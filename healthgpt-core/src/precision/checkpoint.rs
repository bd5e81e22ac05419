use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor};
use tqdm::Iter;
use tracing::info;

use crate::LoadError;

/// Where a checkpoint should materialize its tensors.
#[derive(Debug, Clone)]
pub enum LoadTarget {
    /// Straight onto the execution device.
    Direct(Device),
    /// Into host memory, to be moved afterwards.
    Host,
}

impl LoadTarget {
    pub fn device(&self) -> Device {
        match self {
            Self::Direct(device) => device.clone(),
            Self::Host => Device::Cpu,
        }
    }
}

/// A named tensor store that can be loaded at a given dtype.
pub trait CheckpointSource: Send + Sync {
    fn describe(&self) -> String;

    /// Load every tensor. A direct load that the device cannot satisfy must fail with
    /// [`LoadError::UnsupportedPlacement`].
    fn load(&self, target: &LoadTarget, dtype: DType) -> Result<HashMap<String, Tensor>, LoadError>;
}

/// One or more `.safetensors` (or pickled `.bin`) files.
#[derive(Debug, Clone)]
pub struct SafetensorsCheckpoint {
    files: Vec<PathBuf>,
}

impl SafetensorsCheckpoint {
    /// A single weight file, or every weight file directly inside a directory.
    /// Safetensors files are preferred over `.bin` files when both are present.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        if path.is_file() {
            return Ok(Self {
                files: vec![path.to_path_buf()],
            });
        }
        let entries = std::fs::read_dir(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        let with_ext = |ext: &str| -> Vec<PathBuf> {
            files
                .iter()
                .filter(|p| p.extension().is_some_and(|e| e == ext))
                .cloned()
                .collect()
        };
        let mut selected = with_ext("safetensors");
        if selected.is_empty() {
            selected = with_ext("bin");
        }
        if selected.is_empty() {
            return Err(LoadError::MissingCheckpoint(path.to_path_buf()));
        }
        Ok(Self { files: selected })
    }

    fn load_file(
        &self,
        path: &Path,
        device: &Device,
        dtype: DType,
        accum: &mut HashMap<String, Tensor>,
    ) -> candle_core::Result<()> {
        if path.extension().is_some_and(|e| e == "bin") {
            let tensors = candle_core::pickle::read_all(path)?;
            for (name, tensor) in tensors {
                accum.insert(name, tensor.to_device(device)?.to_dtype(dtype)?);
            }
            return Ok(());
        }
        let tensors = unsafe { candle_core::safetensors::MmapedSafetensors::new(path)? };
        let names: Vec<String> = tensors.tensors().into_iter().map(|(n, _)| n).collect();
        names.into_iter().tqdm().try_for_each(|name| {
            let tensor = tensors.load(&name, device)?.to_dtype(dtype)?;
            accum.insert(name, tensor);
            Ok(())
        })
    }
}

impl CheckpointSource for SafetensorsCheckpoint {
    fn describe(&self) -> String {
        match self.files.as_slice() {
            [one] => one.display().to_string(),
            many => format!("{} weight files", many.len()),
        }
    }

    fn load(&self, target: &LoadTarget, dtype: DType) -> Result<HashMap<String, Tensor>, LoadError> {
        let device = target.device();
        let mut accum = HashMap::new();
        for file in &self.files {
            info!("Loading `{}` as {dtype:?} on {device:?}.", file.display());
            self.load_file(file, &device, dtype, &mut accum)
                .map_err(|e| classify(e, target))?;
        }
        Ok(accum)
    }
}

/// Separate "this device cannot hold this dtype" from every other failure.
pub(crate) fn classify(err: candle_core::Error, target: &LoadTarget) -> LoadError {
    let inner = match &err {
        candle_core::Error::WithBacktrace { inner, .. } => inner.as_ref(),
        other => other,
    };
    match (inner, target) {
        (candle_core::Error::UnsupportedDTypeForOp(dtype, op), LoadTarget::Direct(device)) => {
            LoadError::UnsupportedPlacement {
                device: format!("{device:?}"),
                reason: format!("{op} does not support {dtype:?}"),
            }
        }
        _ => LoadError::Candle(err),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::{classify, LoadTarget, SafetensorsCheckpoint};
    use crate::LoadError;

    #[test]
    fn unsupported_dtype_on_direct_load_is_a_placement_error() {
        let err = candle_core::Error::UnsupportedDTypeForOp(DType::BF16, "to_dtype");
        assert!(matches!(
            classify(err, &LoadTarget::Direct(Device::Cpu)),
            LoadError::UnsupportedPlacement { .. }
        ));
        let err = candle_core::Error::UnsupportedDTypeForOp(DType::BF16, "to_dtype");
        assert!(matches!(
            classify(err, &LoadTarget::Host),
            LoadError::Candle(_)
        ));
        let err = candle_core::Error::Msg("truncated file".to_string());
        assert!(matches!(
            classify(err, &LoadTarget::Direct(Device::Cpu)),
            LoadError::Candle(_)
        ));
    }

    #[test]
    fn empty_directory_has_no_checkpoint() {
        let dir = std::env::temp_dir().join(format!("healthgpt-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            SafetensorsCheckpoint::from_path(&dir),
            Err(LoadError::MissingCheckpoint(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
