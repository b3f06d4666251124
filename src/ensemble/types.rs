use crate::fusion::{FusionError, StapleOutcome};
use crate::sampler::{Mask, NoiseSeed, SamplerOutput, StepSchedule};
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Ensemble configuration
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Number of independent draws per image (R)
    pub ensemble_size: usize,
    pub schedule: StepSchedule,
    pub clip_denoised: bool,
    /// Run draws as a rayon parallel map instead of one after another
    pub parallel: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 5,
            schedule: StepSchedule::Standard { steps: 1000 },
            clip_denoised: true,
            parallel: false,
        }
    }
}

/// One finished draw
#[derive(Debug, Clone)]
pub struct Member {
    /// Position in the ensemble (0-based draw index)
    pub index: usize,
    pub seed: NoiseSeed,
    pub output: SamplerOutput,
    /// Wall-clock time of the sampler call
    pub elapsed: Duration,
}

/// Fully materialized set of draws for one image
///
/// Only built once every draw has succeeded; all members share `shape`.
#[derive(Debug, Clone)]
pub struct Ensemble {
    members: Vec<Member>,
    shape: (usize, usize),
}

impl Ensemble {
    pub(super) fn new(members: Vec<Member>, shape: (usize, usize)) -> Self {
        Self { members, shape }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// (height, width) shared by every member
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Sum of per-draw sampling times
    pub fn total_time(&self) -> Duration {
        self.members.iter().map(|m| m.elapsed).sum()
    }

    /// Calibrated outputs in draw order
    pub fn into_masks(self) -> Vec<Mask> {
        self.members
            .into_iter()
            .map(|m| m.output.calibrated)
            .collect()
    }
}

/// Fused result for one image
#[derive(Debug, Clone)]
pub enum Consensus {
    /// Single draw, passed through; reliability is undefined
    Single(Mask),
    Fused(StapleOutcome),
}

impl Consensus {
    /// Foreground probability map
    pub fn map(&self) -> &Mask {
        match self {
            Consensus::Single(mask) => mask,
            Consensus::Fused(outcome) => &outcome.consensus,
        }
    }

    pub fn outcome(&self) -> Option<&StapleOutcome> {
        match self {
            Consensus::Single(_) => None,
            Consensus::Fused(outcome) => Some(outcome),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome().map_or(false, StapleOutcome::is_degraded)
    }
}

/// Failures that stop processing of one image
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("ensemble size must be at least 1")]
    EmptyEnsemble,

    #[error("sampler failed on member {member}")]
    Sampler {
        member: usize,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("member {member} produced a {found:?} mask, expected {expected:?}")]
    ShapeMismatch {
        member: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("fusion rejected the ensemble")]
    Fusion(#[from] FusionError),
}
