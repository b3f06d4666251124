use super::types::{Consensus, Ensemble, EnsembleConfig, EnsembleError, Member};
use crate::fusion::{staple, StapleConfig};
use crate::sampler::types::spatial_dims;
use crate::sampler::{ConditioningImage, DiffusionSampler, NoiseSeed, SampleRequest};
use rand::Rng;
use rayon::prelude::*;
use std::collections::HashSet;
use std::time::Instant;

/// Draws an ensemble of stochastic segmentations for one image
pub struct EnsembleOrchestrator {
    config: EnsembleConfig,
}

impl EnsembleOrchestrator {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Draw one distinct seed per ensemble member
    ///
    /// Seeds are taken up front so the ensemble does not depend on the order
    /// in which parallel draws finish.
    pub fn draw_seeds<R: Rng>(&self, rng: &mut R) -> Vec<NoiseSeed> {
        let size = self.config.ensemble_size;
        let mut seen = HashSet::with_capacity(size);
        let mut seeds = Vec::with_capacity(size);

        while seeds.len() < size {
            let seed = rng.gen::<u64>();
            if seen.insert(seed) {
                seeds.push(NoiseSeed(seed));
            }
        }

        seeds
    }

    /// Run the sampler `ensemble_size` times on `image`
    ///
    /// # Arguments
    /// * `sampler` - Diffusion sampler, shared read-only by all draws
    /// * `image` - Conditioning image (CHW), never modified
    /// * `rng` - Source of the per-draw noise seeds
    ///
    /// # Errors
    /// Any failed draw aborts the whole ensemble; a partial ensemble is never
    /// returned.
    pub fn run_ensemble<R: Rng>(
        &self,
        sampler: &dyn DiffusionSampler,
        image: &ConditioningImage,
        rng: &mut R,
    ) -> Result<Ensemble, EnsembleError> {
        if self.config.ensemble_size == 0 {
            return Err(EnsembleError::EmptyEnsemble);
        }

        let shape = spatial_dims(image);
        let seeds = self.draw_seeds(rng);

        tracing::debug!(
            "Drawing {} samples with {} sampler ({} steps, accelerated={})",
            seeds.len(),
            sampler.name(),
            self.config.schedule.steps(),
            self.config.schedule.is_accelerated()
        );

        let draw =
            |(index, seed): (usize, NoiseSeed)| self.draw(sampler, image, shape, index, seed);

        let members = if self.config.parallel {
            seeds
                .into_par_iter()
                .enumerate()
                .map(draw)
                .collect::<Result<Vec<Member>, EnsembleError>>()?
        } else {
            seeds
                .into_iter()
                .enumerate()
                .map(draw)
                .collect::<Result<Vec<Member>, EnsembleError>>()?
        };

        Ok(Ensemble::new(members, shape))
    }

    fn draw(
        &self,
        sampler: &dyn DiffusionSampler,
        image: &ConditioningImage,
        shape: (usize, usize),
        index: usize,
        seed: NoiseSeed,
    ) -> Result<Member, EnsembleError> {
        let _span = tracing::debug_span!("draw", member = index).entered();

        let request = SampleRequest {
            seed,
            schedule: self.config.schedule,
            clip_denoised: self.config.clip_denoised,
        };

        let start = Instant::now();
        let output = sampler
            .sample(image, &request)
            .map_err(|source| EnsembleError::Sampler {
                member: index,
                source: source.into(),
            })?;
        let elapsed = start.elapsed();

        let found = output.calibrated.dim();
        if found != shape {
            return Err(EnsembleError::ShapeMismatch {
                member: index,
                expected: shape,
                found,
            });
        }

        tracing::info!(
            "Member {}: sampled in {:.1}ms (seed {})",
            index,
            elapsed.as_secs_f64() * 1000.0,
            seed.0
        );

        Ok(Member {
            index,
            seed,
            output,
            elapsed,
        })
    }
}

/// Reduce an ensemble to its consensus
///
/// A single member is passed through untouched: reliability cannot be
/// estimated from one rater. Two or more go through STAPLE.
pub fn fuse(ensemble: Ensemble, config: &StapleConfig) -> Result<Consensus, EnsembleError> {
    match ensemble.len() {
        0 => Err(EnsembleError::EmptyEnsemble),
        1 => {
            tracing::debug!("Single-member ensemble, skipping fusion");
            let mut masks = ensemble.into_masks();
            masks.pop().map(Consensus::Single).ok_or(EnsembleError::EmptyEnsemble)
        }
        _ => {
            let outcome = staple(&ensemble.into_masks(), config)?;
            if outcome.is_degraded() {
                tracing::warn!(
                    "STAPLE did not converge within {} iterations (max delta {:.3e})",
                    outcome.iterations,
                    outcome.max_delta
                );
            }
            Ok(Consensus::Fused(outcome))
        }
    }
}
