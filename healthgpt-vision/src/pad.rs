use image::{DynamicImage, GenericImage, GenericImageView, ImageResult, Rgb, RgbImage};

/// Padding colour for a normalization mean given in `[0, 1]`: each channel scaled to
/// the pixel range and truncated.
pub fn mean_fill_color(mean: &[f64]) -> Rgb<u8> {
    let mut px = [0u8; 3];
    for (dst, m) in px.iter_mut().zip(mean) {
        *dst = (m * 255.0).clamp(0.0, 255.0) as u8;
    }
    Rgb(px)
}

/// Where an image of `(width, height)` lands inside its square canvas.
pub fn square_offset(width: u32, height: u32) -> (u32, u32) {
    match width.cmp(&height) {
        std::cmp::Ordering::Less => ((height - width) / 2, 0),
        std::cmp::Ordering::Equal => (0, 0),
        std::cmp::Ordering::Greater => (0, (width - height) / 2),
    }
}

/// Pad an image onto a square canvas of its longest edge, centred, without cropping.
/// The result is always RGB.
pub fn expand2square(image: &DynamicImage, background_color: Rgb<u8>) -> ImageResult<DynamicImage> {
    let (width, height) = image.dimensions();
    let rgb = image.to_rgb8();
    if width == height {
        return Ok(DynamicImage::from(rgb));
    }
    let side = width.max(height);
    let (x, y) = square_offset(width, height);
    let mut canvas = RgbImage::from_pixel(side, side, background_color);
    canvas.copy_from(&rgb, x, y)?;
    Ok(DynamicImage::from(canvas))
}
