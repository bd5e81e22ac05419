use candle_core::{Device, Result, Tensor};
use image::DynamicImage;

use crate::{utils::image_to_pixels, ImageTransform};

/// Convert an image to an RGB tensor, keeping values in `[0, 255]`.
/// The tensor's shape is (channels, height, width).
pub struct ToPixels;

impl ImageTransform for ToPixels {
    type Input = DynamicImage;
    type Output = Tensor;

    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output> {
        image_to_pixels(x, device)
    }
}

/// Multiply every value by `factor`.
pub struct Rescale {
    pub factor: f64,
}

impl ImageTransform for Rescale {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        x.affine(self.factor, 0.0)
    }
}

/// Normalize the image data based on the mean and standard deviation.
/// The value is computed as follows:
/// `
/// x[channel]=(x[channel] - mean[channel]) / std[channel]
/// `
///
/// Expects an input tensor of shape (channels, height, width).
pub struct Normalize {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ImageTransform for Normalize {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output> {
        let num_channels = x.dim(0)?;
        if self.mean.len() != num_channels || self.std.len() != num_channels {
            candle_core::bail!("Num channels must match number of mean and std.");
        }
        let mean = Tensor::new(self.mean.as_slice(), device)?
            .to_dtype(x.dtype())?
            .reshape((num_channels, 1, 1))?;
        let std = Tensor::new(self.std.as_slice(), device)?
            .to_dtype(x.dtype())?
            .reshape((num_channels, 1, 1))?;
        x.broadcast_sub(&mean)?.broadcast_div(&std)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use image::{ColorType, DynamicImage, Rgb, RgbImage};

    use crate::{ImageTransform, Normalize, Rescale, ToPixels};

    #[test]
    fn test_to_pixels() {
        let image = DynamicImage::new(4, 5, ColorType::Rgb8);
        let res = ToPixels.map(&image, &Device::Cpu).unwrap();
        assert_eq!(res.dims(), &[3, 5, 4])
    }

    #[test]
    fn rescaled_pixels_are_in_unit_range() {
        let image = DynamicImage::from(RgbImage::from_pixel(2, 2, Rgb([255, 0, 51])));
        let res = ToPixels.map(&image, &Device::Cpu).unwrap();
        let res = Rescale { factor: 1.0 / 255.0 }
            .map(&res, &Device::Cpu)
            .unwrap();
        let px = res.flatten_from(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(px[0][0], 1.0);
        assert_eq!(px[1][3], 0.0);
        assert!((px[2][1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let image = Tensor::ones((3, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let res = Normalize {
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.25, 0.5],
        }
        .map(&image, &Device::Cpu)
        .unwrap();
        assert_eq!(res.dims(), &[3, 5, 4]);
        let first = res.flatten_from(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(first[0][0], 1.0);
        assert_eq!(first[1][0], 2.0);
    }

    #[test]
    fn normalize_rejects_channel_mismatch() {
        let image = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let res = Normalize {
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.5, 0.5],
        }
        .map(&image, &Device::Cpu);
        assert!(res.is_err());
    }
}
