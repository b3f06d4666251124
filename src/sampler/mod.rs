#[cfg(feature = "onnx")]
mod onnx;
mod synthetic;
pub mod types;

#[cfg(feature = "onnx")]
pub use onnx::OnnxSampler;
pub use synthetic::SyntheticSampler;
pub use types::{
    ConditioningImage, DiffusionSampler, Mask, NoiseSeed, SampleRequest, SamplerOutput,
    StepSchedule,
};

#[cfg(feature = "onnx")]
use anyhow::Result;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Create the ONNX-backed sampler for a square model resolution
#[cfg(feature = "onnx")]
pub fn create_onnx_sampler(
    model_path: &std::path::Path,
    image_size: u32,
    channels: usize,
) -> Result<Box<dyn DiffusionSampler>> {
    let sampler = OnnxSampler::new(model_path, image_size, image_size, channels)?;
    Ok(Box::new(sampler))
}

/// Standard-normal field derived only from `seed`
pub fn gaussian_noise(height: usize, width: usize, seed: NoiseSeed) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed.0);
    Array2::from_shape_fn((height, width), |_| rng.sample(StandardNormal))
}
