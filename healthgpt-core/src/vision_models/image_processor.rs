#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{Device, Result, Tensor};
use healthgpt_vision::{ApplyTransforms, ImageTransform, Normalize, Rescale, ToPixels, Transforms};
use image::{DynamicImage, GenericImageView};

use super::preprocessor_config::{PreProcessorConfig, ToFilter};

/// CLIP preprocessing of an already square image: shortest-edge resize, center crop,
/// rescale and normalize. Produces `(3, crop_h, crop_w)` in f32.
#[derive(Debug, Clone)]
pub struct ClipImageProcessor {
    config: PreProcessorConfig,
}

impl ClipImageProcessor {
    pub fn new(config: PreProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreProcessorConfig {
        &self.config
    }

    fn resize(image: &DynamicImage, size: u32, filter: image::imageops::FilterType) -> DynamicImage {
        let (width, height) = image.dimensions();
        if width.min(height) == size {
            return image.clone();
        }
        let (new_width, new_height) = if width < height {
            (size, ((size * height) as f32 / width as f32).ceil() as u32)
        } else {
            (((size * width) as f32 / height as f32).ceil() as u32, size)
        };
        image.resize_exact(new_width, new_height, filter)
    }

    fn center_crop(image: &DynamicImage, (crop_w, crop_h): (u32, u32)) -> DynamicImage {
        let (width, height) = image.dimensions();
        let left = width.saturating_sub(crop_w).div_ceil(2);
        let top = height.saturating_sub(crop_h).div_ceil(2);
        image.crop_imm(left, top, crop_w.min(width), crop_h.min(height))
    }

    pub fn preprocess(&self, image: &DynamicImage, device: &Device) -> Result<Tensor> {
        let cfg = &self.config;
        let mut image = image.clone();
        if cfg.do_resize {
            image = Self::resize(&image, cfg.shortest_edge(), cfg.resample.to_filter()?);
        }
        if cfg.do_center_crop {
            image = Self::center_crop(&image, cfg.crop_size());
        }
        let rescale = Rescale {
            factor: if cfg.do_rescale { cfg.rescale_factor } else { 1. },
        };
        let normalize = Normalize {
            mean: cfg.image_mean().to_vec(),
            std: cfg.image_std().to_vec(),
        };
        let mut inner: Vec<&dyn ImageTransform<Input = Tensor, Output = Tensor>> = vec![&rescale];
        if cfg.do_normalize {
            inner.push(&normalize);
        }
        image.apply(
            Transforms {
                input: &ToPixels,
                inner_transforms: &inner,
            },
            device,
        )
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use image::{DynamicImage, Rgb, RgbImage};

    use super::ClipImageProcessor;
    use crate::vision_models::preprocessor_config::PreProcessorConfig;

    #[test]
    fn output_matches_crop_size() {
        let p = ClipImageProcessor::new(PreProcessorConfig::square(28));
        let img = DynamicImage::from(RgbImage::from_pixel(60, 60, Rgb([10, 20, 30])));
        let t = p.preprocess(&img, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 28, 28]);
    }

    #[test]
    fn mean_colour_normalizes_to_zero() {
        let p = ClipImageProcessor::new(PreProcessorConfig::square(14));
        // CLIP mean * 255, rounded to the nearest byte
        let img = DynamicImage::from(RgbImage::from_pixel(14, 14, Rgb([123, 117, 104])));
        let t = p.preprocess(&img, &Device::Cpu).unwrap();
        let max = t.abs().unwrap().max_keepdim(0).unwrap().flatten_all().unwrap();
        for v in max.to_vec1::<f32>().unwrap() {
            assert!(v < 0.02, "{v}");
        }
    }
}
