use super::types::{
    FusionError, Initialization, PriorMode, RaterReliability, StapleConfig, StapleOutcome,
};
use crate::sampler::Mask;
use ndarray::Array2;
use rayon::prelude::*;

/// Fuse rater label maps into one consensus with STAPLE
///
/// Expectation-maximization over a latent per-pixel truth `T` and a
/// (sensitivity, specificity) pair per rater. Raters are assumed
/// conditionally independent given the truth.
///
/// Soft labels are accepted. When every rater submits the same map it is
/// returned as the consensus without running EM; otherwise labels are split
/// at 0.5 and fused as binary votes.
///
/// Pure and deterministic: no randomness, no I/O, and the reductions run in
/// a fixed order so reruns are bit-identical.
///
/// # Errors
/// Fewer than two raters, differing shapes, empty maps, labels outside
/// [0, 1] and out-of-range config values are rejected before the loop
/// starts. Hitting `max_iterations` is not an error; the outcome is returned
/// with `converged == false`.
pub fn staple(maps: &[Mask], config: &StapleConfig) -> Result<StapleOutcome, FusionError> {
    let _span = tracing::debug_span!("staple", raters = maps.len()).entered();

    validate_config(config)?;
    let (height, width) = validate(maps)?;
    let eps = config.epsilon;

    if maps[1..].iter().all(|m| m == &maps[0]) {
        tracing::debug!("All raters agree, consensus is the shared map");
        return Ok(unanimous(&maps[0], maps.len(), config));
    }

    let labels: Vec<Vec<f64>> = maps
        .iter()
        .map(|m| m.iter().map(|&v| if v > 0.5 { 1.0 } else { 0.0 }).collect())
        .collect();

    let mut truth = mean_vote(&labels);
    let mut raters: Vec<RaterReliability> = match config.initialization {
        Initialization::MajorityVote => labels
            .iter()
            .map(|d| reliability(&truth, d, eps))
            .collect(),
        Initialization::Reliability {
            sensitivity,
            specificity,
        } => vec![
            RaterReliability {
                sensitivity,
                specificity,
            };
            labels.len()
        ],
    };
    let mut prior = foreground_prior(config.prior, &truth, eps);

    let mut history = Vec::new();
    if config.record_history {
        history.push(raters.clone());
    }

    let mut iterations = 0;
    let mut converged = false;
    let mut max_delta = f64::INFINITY;

    while iterations < config.max_iterations {
        iterations += 1;

        let next = expectation(&labels, &raters, prior, eps);
        max_delta = truth
            .iter()
            .zip(&next)
            .map(|(old, new)| (old - new).abs())
            .fold(0.0, f64::max);
        truth = next;

        raters = labels.iter().map(|d| reliability(&truth, d, eps)).collect();
        prior = foreground_prior(config.prior, &truth, eps);

        if config.record_history {
            history.push(raters.clone());
        }

        tracing::trace!(iteration = iterations, max_delta, prior, "staple iteration");

        if max_delta < config.tolerance {
            converged = true;
            break;
        }
    }

    if converged {
        tracing::debug!("STAPLE converged after {} iterations", iterations);
    } else {
        tracing::debug!(
            "STAPLE stopped at the iteration cap ({}), max delta {:.3e}",
            iterations,
            max_delta
        );
    }

    let consensus = Array2::from_shape_fn((height, width), |(y, x)| truth[y * width + x] as f32);

    Ok(StapleOutcome {
        consensus,
        raters,
        prior,
        iterations,
        converged,
        max_delta,
        history,
    })
}

/// Outcome when every rater submitted the same map
fn unanimous(map: &Mask, count: usize, config: &StapleConfig) -> StapleOutcome {
    let perfect = vec![
        RaterReliability {
            sensitivity: 1.0,
            specificity: 1.0,
        };
        count
    ];
    let prior = match config.prior {
        PriorMode::Fixed(f) => f,
        PriorMode::Estimated => map.iter().map(|&v| v as f64).sum::<f64>() / map.len() as f64,
    };
    let history = if config.record_history {
        vec![perfect.clone()]
    } else {
        Vec::new()
    };

    StapleOutcome {
        consensus: map.clone(),
        raters: perfect,
        prior,
        iterations: 0,
        converged: true,
        max_delta: 0.0,
        history,
    }
}

fn validate_config(config: &StapleConfig) -> Result<(), FusionError> {
    let open_below = |v: f64, hi: f64| v > 0.0 && v < hi;
    let closed_unit = |v: f64| (0.0..=1.0).contains(&v);

    if !open_below(config.epsilon, 0.5) {
        return Err(FusionError::InvalidConfig {
            field: "epsilon",
            value: config.epsilon,
        });
    }
    if config.tolerance.is_nan() || config.tolerance < 0.0 {
        return Err(FusionError::InvalidConfig {
            field: "tolerance",
            value: config.tolerance,
        });
    }
    if let PriorMode::Fixed(f) = config.prior {
        if !open_below(f, 1.0) {
            return Err(FusionError::InvalidConfig {
                field: "prior",
                value: f,
            });
        }
    }
    if let Initialization::Reliability {
        sensitivity,
        specificity,
    } = config.initialization
    {
        if !closed_unit(sensitivity) {
            return Err(FusionError::InvalidConfig {
                field: "sensitivity",
                value: sensitivity,
            });
        }
        if !closed_unit(specificity) {
            return Err(FusionError::InvalidConfig {
                field: "specificity",
                value: specificity,
            });
        }
    }

    Ok(())
}

fn validate(maps: &[Mask]) -> Result<(usize, usize), FusionError> {
    if maps.len() < 2 {
        return Err(FusionError::TooFewRaters(maps.len()));
    }

    let expected = maps[0].dim();
    for (index, map) in maps.iter().enumerate().skip(1) {
        if map.dim() != expected {
            return Err(FusionError::ShapeMismatch {
                index,
                expected,
                found: map.dim(),
            });
        }
    }
    if maps[0].is_empty() {
        return Err(FusionError::EmptyMap);
    }

    for (rater, map) in maps.iter().enumerate() {
        if let Some(&value) = map.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(FusionError::InvalidLabel { rater, value });
        }
    }

    Ok(expected)
}

/// Per-pixel mean of the rater labels
fn mean_vote(labels: &[Vec<f64>]) -> Vec<f64> {
    let scale = 1.0 / labels.len() as f64;
    let mut votes = vec![0.0; labels[0].len()];
    for rater in labels {
        for (v, &d) in votes.iter_mut().zip(rater) {
            *v += d;
        }
    }
    votes.iter_mut().for_each(|v| *v *= scale);
    votes
}

fn foreground_prior(mode: PriorMode, truth: &[f64], eps: f64) -> f64 {
    let prior = match mode {
        PriorMode::Fixed(f) => f,
        PriorMode::Estimated => truth.iter().sum::<f64>() / truth.len() as f64,
    };
    prior.clamp(eps, 1.0 - eps)
}

/// Log-likelihood weights of one rater, clamped away from log(0)
struct LogWeights {
    hit: f64,
    miss: f64,
    reject: f64,
    false_alarm: f64,
}

impl LogWeights {
    fn new(rater: &RaterReliability, eps: f64) -> Self {
        let p = rater.sensitivity.clamp(eps, 1.0 - eps);
        let q = rater.specificity.clamp(eps, 1.0 - eps);
        Self {
            hit: p.ln(),
            miss: (1.0 - p).ln(),
            reject: q.ln(),
            false_alarm: (1.0 - q).ln(),
        }
    }
}

/// E-step: posterior foreground probability of every pixel
fn expectation(
    labels: &[Vec<f64>],
    raters: &[RaterReliability],
    prior: f64,
    eps: f64,
) -> Vec<f64> {
    let weights: Vec<LogWeights> = raters.iter().map(|r| LogWeights::new(r, eps)).collect();
    let log_fg_prior = prior.ln();
    let log_bg_prior = (1.0 - prior).ln();

    let mut next = vec![0.0; labels[0].len()];
    next.par_iter_mut().enumerate().for_each(|(idx, t)| {
        let mut log_fg = log_fg_prior;
        let mut log_bg = log_bg_prior;
        for (rater, w) in labels.iter().zip(&weights) {
            let d = rater[idx];
            log_fg += d * w.hit + (1.0 - d) * w.miss;
            log_bg += (1.0 - d) * w.reject + d * w.false_alarm;
        }
        *t = 1.0 / (1.0 + (log_bg - log_fg).exp());
    });
    next
}

/// M-step for one rater against the soft truth
fn reliability(truth: &[f64], labels: &[f64], eps: f64) -> RaterReliability {
    let mut true_pos = 0.0;
    let mut pos = 0.0;
    let mut true_neg = 0.0;
    let mut neg = 0.0;

    for (&t, &d) in truth.iter().zip(labels) {
        true_pos += t * d;
        pos += t;
        true_neg += (1.0 - t) * (1.0 - d);
        neg += 1.0 - t;
    }

    RaterReliability {
        sensitivity: ratio_or_one(true_pos, pos, eps),
        specificity: ratio_or_one(true_neg, neg, eps),
    }
}

/// A rater never exposed to a class cannot have erred on it; less than
/// `eps` of a pixel of class mass counts as no exposure
fn ratio_or_one(num: f64, denom: f64, eps: f64) -> f64 {
    if denom > eps {
        (num / denom).clamp(0.0, 1.0)
    } else {
        1.0
    }
}
