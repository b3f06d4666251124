use super::gaussian_noise;
use super::types::{
    spatial_dims, ConditioningImage, DiffusionSampler, Mask, SampleRequest, SamplerOutput,
};
use anyhow::{ensure, Result};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Reference-mask perturbation sampler
///
/// Stands in for a trained model when none is given. Each draw flips every
/// pixel of the reference mask independently with probability `flip_rate`,
/// so two draws agree on roughly `(1 - f)^2 + f^2` of the pixels.
pub struct SyntheticSampler {
    reference: Mask,
    flip_rate: f32,
}

impl SyntheticSampler {
    pub fn new(reference: Mask, flip_rate: f32) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&flip_rate),
            "flip rate must be in [0, 1], got {}",
            flip_rate
        );
        ensure!(!reference.is_empty(), "reference mask is empty");

        Ok(Self {
            reference,
            flip_rate,
        })
    }
}

impl DiffusionSampler for SyntheticSampler {
    fn sample(&self, image: &ConditioningImage, request: &SampleRequest) -> Result<SamplerOutput> {
        let _span = tracing::debug_span!("synthetic_sample", seed = request.seed.0).entered();

        let (height, width) = spatial_dims(image);
        ensure!(
            (height, width) == self.reference.dim(),
            "conditioning image is {}x{} but the reference mask is {}x{}",
            width,
            height,
            self.reference.dim().1,
            self.reference.dim().0
        );

        let mut rng = StdRng::seed_from_u64(request.seed.0);

        // Soft score on the drawn side of 0.5, so thresholding recovers the label
        let calibration = Array2::from_shape_fn((height, width), |(y, x)| {
            let truth = self.reference[[y, x]] >= 0.5;
            let flipped = rng.gen::<f32>() < self.flip_rate;
            let margin = 0.49 * rng.gen::<f32>();
            if truth != flipped {
                0.51 + margin
            } else {
                0.49 - margin
            }
        });
        let calibrated = calibration.mapv(|v| if v > 0.5 { 1.0 } else { 0.0 });

        let sample = calibrated.mapv(|v| v * 2.0 - 1.0).insert_axis(Axis(0));
        let noisy = gaussian_noise(height, width, request.seed).insert_axis(Axis(0));

        Ok(SamplerOutput {
            sample,
            noisy,
            original: image.clone(),
            calibration,
            calibrated,
        })
    }

    fn input_size(&self) -> (u32, u32) {
        let (height, width) = self.reference.dim();
        (width as u32, height as u32)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::types::{NoiseSeed, StepSchedule};
    use ndarray::Array3;

    fn request(seed: u64) -> SampleRequest {
        SampleRequest {
            seed: NoiseSeed(seed),
            schedule: StepSchedule::Standard { steps: 1000 },
            clip_denoised: true,
        }
    }

    fn half_mask(h: usize, w: usize) -> Mask {
        Array2::from_shape_fn((h, w), |(_, x)| if x < w / 2 { 1.0 } else { 0.0 })
    }

    #[test]
    fn same_seed_same_sample() {
        let sampler = SyntheticSampler::new(half_mask(16, 16), 0.2).unwrap();
        let image = Array3::zeros((4, 16, 16));

        let a = sampler.sample(&image, &request(7)).unwrap();
        let b = sampler.sample(&image, &request(7)).unwrap();
        assert_eq!(a.calibrated, b.calibrated);
        assert_eq!(a.calibration, b.calibration);
        assert_eq!(a.noisy, b.noisy);
    }

    #[test]
    fn different_seeds_differ() {
        let sampler = SyntheticSampler::new(half_mask(32, 32), 0.2).unwrap();
        let image = Array3::zeros((4, 32, 32));

        let a = sampler.sample(&image, &request(1)).unwrap();
        let b = sampler.sample(&image, &request(2)).unwrap();
        assert_ne!(a.calibrated, b.calibrated);
    }

    #[test]
    fn zero_flip_rate_reproduces_reference() {
        let reference = half_mask(8, 12);
        let sampler = SyntheticSampler::new(reference.clone(), 0.0).unwrap();
        let image = Array3::zeros((4, 8, 12));

        let out = sampler.sample(&image, &request(3)).unwrap();
        assert_eq!(out.calibrated, reference);
        assert_eq!(out.original, image);
        assert_eq!(out.sample.dim(), (1, 8, 12));
        assert!(out
            .calibration
            .iter()
            .zip(reference.iter())
            .all(|(&c, &r)| (c > 0.5) == (r > 0.5)));
    }

    #[test]
    fn flip_rate_is_respected_on_average() {
        let reference = half_mask(64, 64);
        let sampler = SyntheticSampler::new(reference.clone(), 0.1).unwrap();
        let image = Array3::zeros((4, 64, 64));

        let out = sampler.sample(&image, &request(11)).unwrap();
        let flipped = out
            .calibrated
            .iter()
            .zip(reference.iter())
            .filter(|(a, b)| a != b)
            .count();
        let rate = flipped as f32 / reference.len() as f32;
        assert!((rate - 0.1).abs() < 0.03, "flip rate {}", rate);
    }

    #[test]
    fn rejects_mismatched_image() {
        let sampler = SyntheticSampler::new(half_mask(8, 8), 0.1).unwrap();
        let image = Array3::zeros((4, 8, 9));
        assert!(sampler.sample(&image, &request(0)).is_err());
    }

    #[test]
    fn rejects_invalid_flip_rate() {
        assert!(SyntheticSampler::new(half_mask(4, 4), 1.5).is_err());
        assert!(SyntheticSampler::new(half_mask(4, 4), -0.1).is_err());
    }
}
