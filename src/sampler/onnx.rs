use super::gaussian_noise;
use super::types::{
    spatial_dims, ConditioningImage, DiffusionSampler, Mask, SampleRequest, SamplerOutput,
};
use anyhow::{anyhow, ensure, Context, Result};
use ndarray::{Array3, Axis};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use std::path::Path;
use std::sync::Mutex;

/// Diffusion sampler backed by an exported reverse-process graph
///
/// The graph runs the whole sampling loop for one draw. Inputs:
/// `image` [1, C, H, W], `noise` [1, 1, H, W], `steps` [1] (i64),
/// `clip_denoised` [1] (0.0 / 1.0). Outputs, in order: sample, noisy,
/// original, calibration, calibrated, each [1, C', H, W].
pub struct OnnxSampler {
    // Running a session needs exclusive access; draws serialise on this lock
    session: Mutex<Session>,
    width: u32,
    height: u32,
    channels: usize,
}

impl OnnxSampler {
    /// Create a new sampler from an ONNX file
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `width`, `height` - Resolution the graph was exported at
    /// * `channels` - Channel count of the conditioning image
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        channels: usize,
    ) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading diffusion sampler from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("Diffusion sampler loaded successfully");

        Ok(Self {
            session: Mutex::new(session),
            width,
            height,
            channels,
        })
    }
}

impl DiffusionSampler for OnnxSampler {
    fn sample(&self, image: &ConditioningImage, request: &SampleRequest) -> Result<SamplerOutput> {
        let _span = tracing::debug_span!("onnx_sample", seed = request.seed.0).entered();

        let (channels, height, width) = image.dim();
        ensure!(
            channels == self.channels,
            "expected {} conditioning channels, got {}",
            self.channels,
            channels
        );
        ensure!(
            (width as u32, height as u32) == (self.width, self.height),
            "expected {}x{} conditioning image, got {}x{}",
            self.width,
            self.height,
            width,
            height
        );

        let noise = gaussian_noise(height, width, request.seed);

        let image_tensor = Tensor::from_array((
            vec![1i64, channels as i64, height as i64, width as i64],
            image.iter().copied().collect::<Vec<f32>>(),
        ))?;
        let noise_tensor = Tensor::from_array((
            vec![1i64, 1, height as i64, width as i64],
            noise.iter().copied().collect::<Vec<f32>>(),
        ))?;
        let steps_tensor = Tensor::from_array((vec![1i64], vec![request.schedule.steps() as i64]))?;
        let clip_tensor = Tensor::from_array((
            vec![1i64],
            vec![if request.clip_denoised { 1.0f32 } else { 0.0 }],
        ))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("diffusion session lock poisoned"))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = session
            .run(ort::inputs![
                "image" => image_tensor,
                "noise" => noise_tensor,
                "steps" => steps_tensor,
                "clip_denoised" => clip_tensor,
            ])
            .context("Failed to run diffusion sampling")?;
        drop(_infer_span);

        let sample = extract_chw(&outputs[0], "sample")?;
        let noisy = extract_chw(&outputs[1], "noisy")?;
        let original = extract_chw(&outputs[2], "original")?;
        let calibration = extract_mask(&outputs[3], "calibration")?;
        let calibrated = extract_mask(&outputs[4], "calibrated")?;

        ensure!(
            spatial_dims(&original) == (height, width),
            "model returned a {:?} original for a {}x{} input",
            original.dim(),
            width,
            height
        );

        Ok(SamplerOutput {
            sample,
            noisy,
            original,
            calibration,
            calibrated,
        })
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

/// Extract a [1, C, H, W] output as a CHW array
fn extract_chw(value: &DynValue, name: &str) -> Result<Array3<f32>> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .with_context(|| format!("Failed to extract `{}` output", name))?;
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

    ensure!(
        dims.len() == 4 && dims[0] == 1,
        "`{}` output has shape {:?}, expected [1, C, H, W]",
        name,
        dims
    );

    Array3::from_shape_vec((dims[1], dims[2], dims[3]), data.to_vec())
        .with_context(|| format!("Malformed `{}` output", name))
}

/// Extract a [1, 1, H, W] output as an H x W mask
fn extract_mask(value: &DynValue, name: &str) -> Result<Mask> {
    let chw = extract_chw(value, name)?;
    ensure!(
        chw.len_of(Axis(0)) == 1,
        "`{}` output has {} channels, expected 1",
        name,
        chw.len_of(Axis(0))
    );
    Ok(chw.index_axis_move(Axis(0), 0))
}
