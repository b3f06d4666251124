use crate::sampler::{ConditioningImage, Mask};
use anyhow::{Context, Result};
use image::{imageops, GrayImage, RgbImage};
use ndarray::{concatenate, Array2, Array3, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

/// Preprocessor for converting dataset images to model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Preprocess an RGB image into a normalized CHW tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions
    /// 2. Convert to float and normalize to [0, 1]
    /// 3. Transpose from HWC to CHW format
    ///
    /// Returns: Array3<f32> with shape [3, height, width]
    pub fn preprocess(&self, image: &RgbImage) -> Array3<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = if image.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Lanczos3,
            )
        } else {
            image.clone()
        };

        let (width, height) = resized.dimensions();
        Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        })
    }

    /// Resize a reference mask and binarize it at half intensity
    ///
    /// Nearest-neighbour resampling keeps the mask binary at the edges.
    pub fn preprocess_mask(&self, mask: &GrayImage) -> Mask {
        let resized = if mask.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                mask,
                self.target_width,
                self.target_height,
                imageops::FilterType::Nearest,
            )
        } else {
            mask.clone()
        };

        let (width, height) = resized.dimensions();
        Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            if resized.get_pixel(x as u32, y as u32)[0] >= 128 {
                1.0
            } else {
                0.0
            }
        })
    }

    /// Append one standard-normal channel to a CHW image
    ///
    /// The diffusion model is conditioned on the colour channels plus this
    /// noise channel; the result has `C + 1` channels.
    pub fn with_noise_channel<R: Rng>(
        image: &Array3<f32>,
        rng: &mut R,
    ) -> Result<ConditioningImage> {
        let (_, height, width) = image.dim();
        let noise: Array2<f32> =
            Array2::from_shape_fn((height, width), |_| rng.sample(StandardNormal));

        concatenate(Axis(0), &[image.view(), noise.insert_axis(Axis(0)).view()])
            .context("Failed to append noise channel")
    }
}
