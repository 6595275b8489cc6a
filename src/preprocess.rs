use candle_core::{Device, Result as CandleResult, Tensor};
use image::{DynamicImage, GenericImageView, ImageReader, ImageResult};
use std::path::Path;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// detector input resize: the shorter side goes to `shorter_side` unless that pushes the longer
/// side past `max_size`, in which case the longer side goes to `max_size`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub shorter_side: u32,
    pub max_size: u32,
}

impl Default for Resize {
    fn default() -> Self {
        Self {
            shorter_side: 800,
            max_size: 1333,
        }
    }
}

impl Resize {
    /// target (width, height) for an image of the given (width, height)
    pub fn target_size(&self, (width, height): (u32, u32)) -> (u32, u32) {
        let min_original = width.min(height) as f64;
        let max_original = width.max(height) as f64;
        let mut size = self.shorter_side;
        if max_original / min_original * size as f64 > self.max_size as f64 {
            size = (self.max_size as f64 * min_original / max_original).round() as u32;
        }
        if (width <= height && width == size) || (height <= width && height == size) {
            return (width, height);
        }
        if width < height {
            (size, (size as f64 * height as f64 / width as f64) as u32)
        } else {
            ((size as f64 * width as f64 / height as f64) as u32, size)
        }
    }
}

/// decode an image from path, guessing the format from its content
pub fn read_image<P: AsRef<Path>>(image_path: P) -> ImageResult<DynamicImage> {
    ImageReader::open(image_path)?.with_guessed_format()?.decode()
}

/// (width, height) of an image on disk, read from its header only
pub fn read_image_size<P: AsRef<Path>>(image_path: P) -> ImageResult<(u32, u32)> {
    image::image_dimensions(image_path)
}

/// resize for the detector, leaving the image untouched when `resize` is `None`
pub fn resize_image(image: DynamicImage, resize: Option<Resize>) -> DynamicImage {
    match resize {
        Some(resize) => {
            let (width, height) = resize.target_size(image.dimensions());
            if (width, height) == image.dimensions() {
                image
            } else {
                image.resize_exact(width, height, image::imageops::FilterType::Triangle)
            }
        }
        None => image,
    }
}

/// load dynamic image into a normalized (3, height, width) device tensor
pub fn load_image_tensor(image: DynamicImage, device: &Device) -> CandleResult<Tensor> {
    let image = image.to_rgb8();
    let (width, height) = image.dimensions();
    let data = image.into_raw();
    let data =
        Tensor::from_vec(data, (height as usize, width as usize, 3), device)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGENET_MEAN, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGENET_STD, device)?.reshape((3, 1, 1))?;
    (data.to_dtype(candle_core::DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}
