use std::{collections::HashMap, path::Path};

use candle_core::Result;
use either::Either;
use image::imageops::FilterType;
use serde::Deserialize;

use crate::LoadError;

#[allow(clippy::excessive_precision)]
pub const CLIP_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
#[allow(clippy::excessive_precision)]
pub const CLIP_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];

fn d_true() -> bool {
    true
}

fn d_rescale_factor() -> f64 {
    1. / 255.
}

fn d_resample() -> usize {
    3
}

type SizeSpec = Option<Either<u32, HashMap<String, u32>>>;

/// `preprocessor_config.json` of a CLIP image processor.
#[derive(Deserialize, Debug, Clone)]
pub struct PreProcessorConfig {
    #[serde(default = "d_true")]
    pub do_resize: bool,
    #[serde(default, with = "either::serde_untagged_optional")]
    pub size: SizeSpec,
    #[serde(default = "d_true")]
    pub do_center_crop: bool,
    #[serde(default, with = "either::serde_untagged_optional")]
    pub crop_size: SizeSpec,
    #[serde(default = "d_true")]
    pub do_rescale: bool,
    #[serde(default = "d_rescale_factor")]
    pub rescale_factor: f64,
    #[serde(default = "d_true")]
    pub do_normalize: bool,
    pub image_mean: Option<[f64; 3]>,
    pub image_std: Option<[f64; 3]>,
    #[serde(default = "d_resample", alias = "resampling")]
    pub resample: usize,
}

impl Default for PreProcessorConfig {
    fn default() -> Self {
        Self::square(336)
    }
}

impl PreProcessorConfig {
    /// CLIP defaults at `side` pixels.
    pub fn square(side: u32) -> Self {
        Self {
            do_resize: true,
            size: Some(Either::Left(side)),
            do_center_crop: true,
            crop_size: Some(Either::Left(side)),
            do_rescale: true,
            rescale_factor: d_rescale_factor(),
            do_normalize: true,
            image_mean: None,
            image_std: None,
            resample: d_resample(),
        }
    }

    pub fn from_file(path: &Path) -> std::result::Result<Self, LoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn image_mean(&self) -> [f64; 3] {
        self.image_mean.unwrap_or(CLIP_MEAN)
    }

    pub fn image_std(&self) -> [f64; 3] {
        self.image_std.unwrap_or(CLIP_STD)
    }

    pub fn shortest_edge(&self) -> u32 {
        match &self.size {
            Some(Either::Left(s)) => *s,
            Some(Either::Right(map)) => map
                .get("shortest_edge")
                .or_else(|| map.get("height"))
                .copied()
                .unwrap_or(336),
            None => 336,
        }
    }

    /// `(width, height)` of the center crop.
    pub fn crop_size(&self) -> (u32, u32) {
        match &self.crop_size {
            Some(Either::Left(s)) => (*s, *s),
            Some(Either::Right(map)) => {
                let h = map.get("height").copied().unwrap_or(336);
                let w = map.get("width").copied().unwrap_or(h);
                (w, h)
            }
            None => {
                let s = self.shortest_edge();
                (s, s)
            }
        }
    }
}

pub trait ToFilter {
    fn to_filter(self) -> Result<FilterType>;
}

impl ToFilter for usize {
    // https://github.com/python-pillow/Pillow/blob/4b68563e8a818fb9c528fa159ddf3f4eaefa35e6/src/PIL/Image.py#L164-L170
    fn to_filter(self) -> Result<FilterType> {
        match self {
            0 => Ok(FilterType::Nearest),
            1 => Ok(FilterType::Lanczos3),
            2 => Ok(FilterType::Triangle),   // BiLinear
            3 => Ok(FilterType::CatmullRom), // BiCubic
            4 => Ok(FilterType::Nearest),
            x => candle_core::bail!("Filter number {x} not supported"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PreProcessorConfig, CLIP_MEAN};

    #[test]
    fn hf_clip_336_config() {
        let raw = r#"{
            "crop_size": {"height": 336, "width": 336},
            "do_center_crop": true,
            "do_normalize": true,
            "do_resize": true,
            "image_mean": [0.48145466, 0.4578275, 0.40821073],
            "image_std": [0.26862954, 0.26130258, 0.27577711],
            "resample": 3,
            "size": {"shortest_edge": 336}
        }"#;
        let cfg: PreProcessorConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.shortest_edge(), 336);
        assert_eq!(cfg.crop_size(), (336, 336));
        assert_eq!(cfg.image_mean(), CLIP_MEAN);
        assert!(cfg.do_rescale);
    }

    #[test]
    fn integer_sizes() {
        let cfg: PreProcessorConfig = serde_json::from_str(r#"{"size": 224, "crop_size": 224}"#).unwrap();
        assert_eq!(cfg.shortest_edge(), 224);
        assert_eq!(cfg.crop_size(), (224, 224));
    }
}
