use anyhow::Result;
use ndarray::{Array2, Array3};

/// Conditioning image in CHW layout: colour channels followed by the noise channel
pub type ConditioningImage = Array3<f32>;

/// Per-pixel label map: 0.0 = background, 1.0 = foreground, soft values in between
/// Dimensions match the spatial resolution of the conditioning image
pub type Mask = Array2<f32>;

/// Seed for one diffusion draw
///
/// Every member of an ensemble gets its own seed; reusing one collapses two
/// draws into the same sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoiseSeed(pub u64);

/// Reverse-process schedule, opaque to everything but the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSchedule {
    /// Full ancestral sampling over every diffusion step
    Standard { steps: usize },
    /// Implicit (DDIM-style) sampling over a respaced subset of steps
    Accelerated { steps: usize },
}

impl StepSchedule {
    pub fn steps(&self) -> usize {
        match *self {
            StepSchedule::Standard { steps } | StepSchedule::Accelerated { steps } => steps,
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, StepSchedule::Accelerated { .. })
    }
}

/// Per-draw sampling parameters
#[derive(Debug, Clone, Copy)]
pub struct SampleRequest {
    pub seed: NoiseSeed,
    pub schedule: StepSchedule,
    pub clip_denoised: bool,
}

/// Everything one reverse-process run produces
///
/// Only `calibrated` feeds fusion; the rest is kept for inspection artifacts.
#[derive(Debug, Clone)]
pub struct SamplerOutput {
    /// Final denoised sample, CHW; the segmentation lives in the last channel
    pub sample: Array3<f32>,
    /// Noisy intermediate of the trajectory, CHW
    pub noisy: Array3<f32>,
    /// The conditioning image as seen by the model, CHW
    pub original: Array3<f32>,
    /// Raw calibration map
    pub calibration: Mask,
    /// Thresholded / calibrated segmentation output
    pub calibrated: Mask,
}

/// Trait for diffusion samplers
/// Allows swapping between an exported model and the synthetic passthrough sampler
///
/// Samplers are pure with respect to their inputs: the same image, seed and
/// schedule must give the same output. Implementations are shared across
/// parallel draws, hence `Send + Sync`.
pub trait DiffusionSampler: Send + Sync {
    /// Draw one stochastic segmentation for `image`
    ///
    /// # Arguments
    /// * `image` - Conditioning image (CHW)
    /// * `request` - Seed, schedule and clipping flag for this draw
    fn sample(&self, image: &ConditioningImage, request: &SampleRequest) -> Result<SamplerOutput>;

    /// Get the model's expected input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32);

    /// Short name used in log lines
    fn name(&self) -> &str {
        "diffusion"
    }
}

/// Spatial (height, width) of a CHW array
pub fn spatial_dims(image: &Array3<f32>) -> (usize, usize) {
    let (_, height, width) = image.dim();
    (height, width)
}
