use std::path::Path;

use image::{DynamicImage, imageops::FilterType};
use ndarray::Array3;

use crate::Result;

/// The per channel statistics the pretrained backbones were trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decodes the image at `path` and preprocesses it, see `preprocess`.
pub fn load_image<P: AsRef<Path>>(path: P, size: u32) -> Result<Array3<f32>> {
    let image = image::open(path)?;
    Ok(preprocess(&image, size))
}

/// Resizes `image` to `size`x`size`, converts it to RGB and normalizes every channel.
///
/// # Returns
/// The `(3, size, size)` channel major pixels.
pub fn preprocess(image: &DynamicImage, size: u32) -> Array3<f32> {
    let rgb = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let side = size as usize;

    // HWC -> CHW
    Array3::from_shape_fn((3, side, side), |(c, y, x)| {
        let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.;
        (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
    })
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    fn normalized(value: u8, c: usize) -> f32 {
        (value as f32 / 255. - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
    }

    #[test]
    fn solid_images_normalize_per_channel() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 4, Rgb([255, 0, 128])));
        let x = preprocess(&image, 5);

        assert_eq!(x.dim(), (3, 5, 5));
        for (c, value) in [255, 0, 128].into_iter().enumerate() {
            let expected = normalized(value, c);
            assert!(x.index_axis(ndarray::Axis(0), c).iter().all(|v| (v - expected).abs() < 1e-2));
        }
    }

    #[test]
    fn grayscale_files_load_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        GrayImage::from_pixel(3, 3, Luma([51])).save(&path).unwrap();

        let x = load_image(&path, 2).unwrap();

        assert_eq!(x.dim(), (3, 2, 2));
        assert!((x[[2, 1, 1]] - normalized(51, 2)).abs() < 1e-2);
    }

    #[test]
    fn unreadable_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();

        assert!(load_image(&path, 4).is_err());
    }
}
