use crate::sampler::Mask;
use thiserror::Error;

/// How the prior probability of a foreground pixel is obtained
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriorMode {
    /// Mean of the current truth estimate, refreshed every iteration
    Estimated,
    /// Fixed foreground fraction in (0, 1)
    Fixed(f64),
}

/// Starting point of the EM loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initialization {
    /// Truth starts as the per-pixel mean vote; one M-step seeds the raters
    MajorityVote,
    /// Every rater starts with the same reliability; the loop opens with an E-step
    Reliability { sensitivity: f64, specificity: f64 },
}

/// STAPLE configuration
#[derive(Debug, Clone)]
pub struct StapleConfig {
    /// Stop once the largest per-pixel change in truth falls below this
    pub tolerance: f64,
    /// Iteration cap; hitting it yields a degraded (unconverged) outcome
    pub max_iterations: usize,
    /// Floor keeping probabilities away from 0 and 1 inside logarithms
    pub epsilon: f64,
    pub prior: PriorMode,
    pub initialization: Initialization,
    /// Keep rater parameters from every iteration in the outcome
    pub record_history: bool,
}

impl Default for StapleConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 100,
            epsilon: 1e-7,
            prior: PriorMode::Estimated,
            initialization: Initialization::MajorityVote,
            record_history: false,
        }
    }
}

/// Estimated reliability of one rater (one ensemble member)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaterReliability {
    /// P(rater says foreground | truth is foreground)
    pub sensitivity: f64,
    /// P(rater says background | truth is background)
    pub specificity: f64,
}

/// Result of a STAPLE run
#[derive(Debug, Clone)]
pub struct StapleOutcome {
    /// Per-pixel probability that the true label is foreground
    pub consensus: Mask,
    /// Final reliability per rater, in input order
    pub raters: Vec<RaterReliability>,
    /// Foreground prior used by the last E-step
    pub prior: f64,
    /// Number of E-steps run
    pub iterations: usize,
    pub converged: bool,
    /// Largest per-pixel change in the last iteration
    pub max_delta: f64,
    /// Rater parameters after initialization and after each iteration,
    /// empty unless `record_history` was set
    pub history: Vec<Vec<RaterReliability>>,
}

impl StapleOutcome {
    /// Iteration cap reached before the tolerance was met
    pub fn is_degraded(&self) -> bool {
        !self.converged
    }

    /// Hard consensus mask: 1.0 where the foreground probability exceeds `threshold`
    pub fn binarize(&self, threshold: f32) -> Mask {
        self.consensus
            .mapv(|p| if p > threshold { 1.0 } else { 0.0 })
    }
}

/// Structural problems that stop fusion before any EM work
#[derive(Debug, Error, PartialEq)]
pub enum FusionError {
    #[error("fusion needs at least 2 raters, got {0}")]
    TooFewRaters(usize),

    #[error("rater {index} is {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("label maps have zero area")]
    EmptyMap,

    #[error("rater {rater} has label {value} outside [0, 1]")]
    InvalidLabel { rater: usize, value: f32 },

    #[error("STAPLE {field} = {value} is out of range")]
    InvalidConfig { field: &'static str, value: f64 },
}
