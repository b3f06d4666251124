mod dataset;
mod ensemble;
mod fusion;
mod output;
mod sampler;

use anyhow::{Context, Result};
use clap::Parser;
use dataset::{DatasetItem, FolderDataset, Preprocessor};
use ensemble::{fuse, Consensus, EnsembleConfig, EnsembleOrchestrator};
use fusion::types::{Initialization, PriorMode};
use fusion::StapleConfig;
use output::{ArtifactSink, ImageFileSink};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sampler::{DiffusionSampler, StepSchedule, SyntheticSampler};
use std::path::PathBuf;
use std::time::Instant;

/// Colour channels plus the appended noise channel
const CONDITIONING_CHANNELS: usize = 4;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dataset folder (images with `<stem>_Segmentation.png` masks)
    #[arg(long, default_value = "./data/testing")]
    data_dir: PathBuf,

    /// Directory for member and consensus images
    #[arg(long, default_value = "./results")]
    out_dir: PathBuf,

    /// Path to the diffusion sampler (ONNX file)
    /// If not provided, runs in passthrough mode with a synthetic sampler
    /// that perturbs the reference masks
    #[arg(long)]
    model: Option<PathBuf>,

    /// Number of samples drawn per image
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    num_ensemble: u32,

    /// Stop after this many images (default: one full pass)
    #[arg(long)]
    num_samples: Option<usize>,

    /// Model input resolution (square)
    #[arg(long, default_value_t = 256)]
    image_size: u32,

    /// Use accelerated (implicit) sampling
    #[arg(long)]
    use_ddim: bool,

    /// Steps of the standard schedule
    #[arg(long, default_value_t = 1000)]
    diffusion_steps: usize,

    /// Steps of the accelerated schedule
    #[arg(long, default_value_t = 100)]
    ddim_steps: usize,

    /// Clip the denoised estimate at every step
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    clip_denoised: bool,

    /// Seed for noise channels and per-draw seeds
    #[arg(long, default_value_t = 10)]
    seed: u64,

    /// Per-pixel disagreement rate of the synthetic sampler
    #[arg(long, default_value_t = 0.1)]
    flip_rate: f32,

    /// STAPLE convergence tolerance
    #[arg(long, default_value_t = 1e-6)]
    tolerance: f64,

    /// STAPLE iteration cap
    #[arg(long, default_value_t = 100)]
    max_iterations: usize,

    /// Fixed foreground prior in (0, 1)
    /// If not provided, the prior is re-estimated from the consensus every
    /// iteration
    #[arg(long)]
    prior: Option<f64>,

    /// Starting sensitivity of every member (skips the majority-vote start)
    #[arg(long, requires = "init_specificity")]
    init_sensitivity: Option<f64>,

    /// Starting specificity of every member
    #[arg(long, requires = "init_sensitivity")]
    init_specificity: Option<f64>,

    /// Log member reliability after every STAPLE iteration
    #[arg(long)]
    staple_history: bool,

    /// Draw ensemble members in parallel
    #[arg(long)]
    parallel: bool,

    /// Only write the consensus image
    #[arg(long)]
    skip_member_artifacts: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Per-run knobs that are not part of the ensemble or fusion config
struct PipelineOptions {
    flip_rate: f32,
    write_members: bool,
    limit: Option<usize>,
}

#[derive(Debug, Default)]
struct RunSummary {
    processed: usize,
    failed: usize,
    degraded: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let schedule = if args.use_ddim {
        StepSchedule::Accelerated {
            steps: args.ddim_steps,
        }
    } else {
        StepSchedule::Standard {
            steps: args.diffusion_steps,
        }
    };

    tracing::info!("segdiff-ensemble starting");
    tracing::info!("Ensemble size: {}", args.num_ensemble);
    tracing::info!("Schedule: {:?}, clip_denoised={}", schedule, args.clip_denoised);
    tracing::info!("Image size: {}x{}", args.image_size, args.image_size);

    let dataset = FolderDataset::open(&args.data_dir, args.image_size)
        .context("Failed to open dataset")?;
    if dataset.is_empty() {
        tracing::warn!("No images found in {}", args.data_dir.display());
    }
    let mut sink =
        ImageFileSink::new(&args.out_dir).context("Failed to prepare output directory")?;

    let model: Option<Box<dyn DiffusionSampler>> = if let Some(model_path) = &args.model {
        let model = load_model(model_path, args.image_size)
            .context("Failed to load diffusion sampler")?;
        Some(model)
    } else {
        tracing::info!("Running in passthrough mode (synthetic sampler)");
        None
    };

    let orchestrator = EnsembleOrchestrator::new(EnsembleConfig {
        ensemble_size: args.num_ensemble as usize,
        schedule,
        clip_denoised: args.clip_denoised,
        parallel: args.parallel,
    });
    let staple_config = staple_config(&args);
    let options = PipelineOptions {
        flip_rate: args.flip_rate,
        write_members: !args.skip_member_artifacts,
        limit: args.num_samples,
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    let summary = run_pipeline(
        &dataset,
        &mut sink,
        model.as_deref(),
        &orchestrator,
        &staple_config,
        &options,
        &mut rng,
    );

    tracing::info!(
        "Done: {} processed, {} failed, {} unconverged",
        summary.processed,
        summary.failed,
        summary.degraded
    );

    Ok(())
}

fn staple_config(args: &Args) -> StapleConfig {
    let prior = args.prior.map_or(PriorMode::Estimated, PriorMode::Fixed);
    let initialization = match (args.init_sensitivity, args.init_specificity) {
        (Some(sensitivity), Some(specificity)) => Initialization::Reliability {
            sensitivity,
            specificity,
        },
        _ => Initialization::MajorityVote,
    };

    StapleConfig {
        tolerance: args.tolerance,
        max_iterations: args.max_iterations,
        prior,
        initialization,
        record_history: args.staple_history,
        ..Default::default()
    }
}

#[cfg(feature = "onnx")]
fn load_model(model_path: &std::path::Path, image_size: u32) -> Result<Box<dyn DiffusionSampler>> {
    sampler::create_onnx_sampler(model_path, image_size, CONDITIONING_CHANNELS)
}

#[cfg(not(feature = "onnx"))]
fn load_model(
    model_path: &std::path::Path,
    _image_size: u32,
) -> Result<Box<dyn DiffusionSampler>> {
    anyhow::bail!(
        "cannot load {}: built without the `onnx` feature",
        model_path.display()
    )
}

/// Process every dataset item; a failed image is logged and skipped
fn run_pipeline<O>(
    dataset: &FolderDataset,
    sink: &mut O,
    model: Option<&dyn DiffusionSampler>,
    orchestrator: &EnsembleOrchestrator,
    staple_config: &StapleConfig,
    options: &PipelineOptions,
    rng: &mut StdRng,
) -> RunSummary
where
    O: ArtifactSink,
{
    let mut summary = RunSummary::default();
    let limit = options.limit.unwrap_or(usize::MAX);

    tracing::info!(
        "Processing up to {} of {} images",
        limit.min(dataset.len()),
        dataset.len()
    );
    if orchestrator.config().ensemble_size == 2 && staple_config.prior == PriorMode::Estimated {
        tracing::warn!(
            "Two members and an estimated prior: disagreements stay at 0.5 (see --prior)"
        );
    }

    for (position, item) in dataset.iter().take(limit).enumerate() {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                tracing::error!("Image #{}: {:#}", position, e);
                summary.failed += 1;
                continue;
            }
        };

        tracing::info!("Sampling image {}", item.identifier);
        match process_item(&item, sink, model, orchestrator, staple_config, options, rng) {
            Ok(consensus) => {
                summary.processed += 1;
                if consensus.is_degraded() {
                    summary.degraded += 1;
                }
            }
            Err(e) => {
                tracing::error!("Image {}: {:#}", item.identifier, e);
                summary.failed += 1;
            }
        }
    }

    summary
}

fn process_item<O>(
    item: &DatasetItem,
    sink: &mut O,
    model: Option<&dyn DiffusionSampler>,
    orchestrator: &EnsembleOrchestrator,
    staple_config: &StapleConfig,
    options: &PipelineOptions,
    rng: &mut StdRng,
) -> Result<Consensus>
where
    O: ArtifactSink,
{
    let image = Preprocessor::with_noise_channel(&item.image, rng)?;
    anyhow::ensure!(
        image.dim().0 == CONDITIONING_CHANNELS,
        "expected {} conditioning channels, got {}",
        CONDITIONING_CHANNELS,
        image.dim().0
    );

    let synthetic;
    let sampler: &dyn DiffusionSampler = match model {
        Some(model) => model,
        None => {
            synthetic = SyntheticSampler::new(item.reference.clone(), options.flip_rate)?;
            &synthetic
        }
    };

    let start = Instant::now();
    let ensemble = orchestrator
        .run_ensemble(sampler, &image, rng)
        .context("Ensemble sampling failed")?;
    tracing::info!(
        "Drew {} samples of {:?} in {:.1}ms (sampler time {:.1}ms)",
        ensemble.len(),
        ensemble.shape(),
        start.elapsed().as_secs_f64() * 1000.0,
        ensemble.total_time().as_secs_f64() * 1000.0
    );

    for member in ensemble.members() {
        tracing::debug!(
            "  member {}: seed {}, {:.1}ms",
            member.index,
            member.seed.0,
            member.elapsed.as_secs_f64() * 1000.0
        );
        if options.write_members {
            sink.write_member(&item.identifier, member.index, &member.output)?;
        }
    }

    let consensus = fuse(ensemble, staple_config).context("Fusion failed")?;
    match consensus.outcome() {
        Some(outcome) => {
            tracing::info!(
                "STAPLE: {} iterations, converged={}, prior={:.3}, foreground={} px",
                outcome.iterations,
                outcome.converged,
                outcome.prior,
                outcome.binarize(0.5).sum() as usize
            );
            for (i, rater) in outcome.raters.iter().enumerate() {
                tracing::info!(
                    "  member {}: sensitivity={:.4}, specificity={:.4}",
                    i,
                    rater.sensitivity,
                    rater.specificity
                );
            }
            for (iteration, raters) in outcome.history.iter().enumerate() {
                let summary: Vec<String> = raters
                    .iter()
                    .map(|r| format!("({:.4}, {:.4})", r.sensitivity, r.specificity))
                    .collect();
                tracing::debug!("  iteration {}: {}", iteration, summary.join(" "));
            }
        }
        None => tracing::info!("Single sample, consensus is the sample itself"),
    }

    sink.write_consensus(&item.identifier, consensus.map())?;

    Ok(consensus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{ConditioningImage, Mask, SampleRequest, SamplerOutput};
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use std::path::Path;
    use tempfile::tempdir;

    fn write_pair(dir: &Path, stem: &str) {
        RgbImage::from_pixel(16, 16, Rgb([90, 60, 30]))
            .save(dir.join(format!("{}.jpg", stem)))
            .unwrap();
        GrayImage::from_fn(16, 16, |x, y| {
            let d = ((x as f32 - 8.0).powi(2) + (y as f32 - 8.0).powi(2)).sqrt();
            Luma([if d < 5.0 { 255 } else { 0 }])
        })
        .save(dir.join(format!("{}_Segmentation.png", stem)))
        .unwrap();
    }

    fn options(write_members: bool) -> PipelineOptions {
        PipelineOptions {
            flip_rate: 0.1,
            write_members,
            limit: None,
        }
    }

    struct BrokenSampler;

    impl DiffusionSampler for BrokenSampler {
        fn sample(
            &self,
            _image: &ConditioningImage,
            _request: &SampleRequest,
        ) -> Result<SamplerOutput> {
            anyhow::bail!("device lost")
        }

        fn input_size(&self) -> (u32, u32) {
            (16, 16)
        }
    }

    /// Records what was written instead of touching the filesystem
    #[derive(Default)]
    struct RecordingSink {
        members: Vec<(String, usize)>,
        consensus: Vec<(String, Mask)>,
    }

    impl ArtifactSink for RecordingSink {
        fn write_member(
            &mut self,
            identifier: &str,
            index: usize,
            _output: &SamplerOutput,
        ) -> Result<PathBuf> {
            self.members.push((identifier.to_string(), index));
            Ok(PathBuf::from(identifier))
        }

        fn write_consensus(&mut self, identifier: &str, consensus: &Mask) -> Result<PathBuf> {
            self.consensus.push((identifier.to_string(), consensus.clone()));
            Ok(PathBuf::from(identifier))
        }
    }

    #[test]
    fn passthrough_run_writes_all_artifacts() {
        let data = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_pair(data.path(), "ISIC_0000001");
        write_pair(data.path(), "ISIC_0000002");

        let dataset = FolderDataset::open(data.path(), 16).unwrap();
        let mut sink = ImageFileSink::new(out.path()).unwrap();
        let orchestrator = EnsembleOrchestrator::new(EnsembleConfig {
            ensemble_size: 3,
            ..Default::default()
        });

        let summary = run_pipeline(
            &dataset,
            &mut sink,
            None,
            &orchestrator,
            &StapleConfig::default(),
            &options(true),
            &mut StdRng::seed_from_u64(10),
        );

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 0);
        for id in ["0000001", "0000002"] {
            for i in 0..3 {
                assert!(out.path().join(format!("{}_output{}.jpg", id, i)).exists());
            }
            assert!(out.path().join(format!("{}_output_ens.jpg", id)).exists());
        }
    }

    #[test]
    fn failing_sampler_skips_image_and_continues() {
        let data = tempdir().unwrap();
        write_pair(data.path(), "ISIC_0000001");
        write_pair(data.path(), "ISIC_0000002");

        let dataset = FolderDataset::open(data.path(), 16).unwrap();
        let mut sink = RecordingSink::default();
        let orchestrator = EnsembleOrchestrator::new(EnsembleConfig::default());

        let summary = run_pipeline(
            &dataset,
            &mut sink,
            Some(&BrokenSampler as &dyn DiffusionSampler),
            &orchestrator,
            &StapleConfig::default(),
            &options(true),
            &mut StdRng::seed_from_u64(10),
        );

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed, 2);
        assert!(sink.members.is_empty());
        assert!(sink.consensus.is_empty());
    }

    #[test]
    fn limit_and_member_skipping_are_honoured() {
        let data = tempdir().unwrap();
        write_pair(data.path(), "ISIC_0000001");
        write_pair(data.path(), "ISIC_0000002");

        let dataset = FolderDataset::open(data.path(), 16).unwrap();
        let mut sink = RecordingSink::default();
        let orchestrator = EnsembleOrchestrator::new(EnsembleConfig {
            ensemble_size: 1,
            ..Default::default()
        });
        let options = PipelineOptions {
            limit: Some(1),
            ..options(false)
        };

        let summary = run_pipeline(
            &dataset,
            &mut sink,
            None,
            &orchestrator,
            &StapleConfig::default(),
            &options,
            &mut StdRng::seed_from_u64(10),
        );

        assert_eq!(summary.processed, 1);
        assert!(sink.members.is_empty());
        assert_eq!(sink.consensus.len(), 1);
        assert_eq!(sink.consensus[0].0, "0000001");
        assert_eq!(sink.consensus[0].1.dim(), (16, 16));
    }

    #[test]
    fn unconverged_images_are_counted_and_written() {
        let data = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_pair(data.path(), "ISIC_0000001");
        write_pair(data.path(), "ISIC_0000002");

        let dataset = FolderDataset::open(data.path(), 16).unwrap();
        let mut sink = ImageFileSink::new(out.path()).unwrap();
        let orchestrator = EnsembleOrchestrator::new(EnsembleConfig {
            ensemble_size: 3,
            ..Default::default()
        });
        let capped = StapleConfig {
            max_iterations: 1,
            tolerance: 0.0,
            ..Default::default()
        };

        let summary = run_pipeline(
            &dataset,
            &mut sink,
            None,
            &orchestrator,
            &capped,
            &options(false),
            &mut StdRng::seed_from_u64(10),
        );

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.degraded, summary.processed);
        for id in ["0000001", "0000002"] {
            assert!(out.path().join(format!("{}_output_ens.jpg", id)).exists());
            assert!(!out.path().join(format!("{}_output0.jpg", id)).exists());
        }
    }

    fn disk(size: usize, radius: f32) -> Mask {
        let c = size as f32 / 2.0;
        Mask::from_shape_fn((size, size), |(y, x)| {
            let d = ((x as f32 - c).powi(2) + (y as f32 - c).powi(2)).sqrt();
            if d <= radius {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn cli_fusion_options_build_the_staple_config() {
        let args = Args::parse_from(["segdiff-ensemble"]);
        let config = staple_config(&args);
        assert_eq!(config.prior, PriorMode::Estimated);
        assert_eq!(config.initialization, Initialization::MajorityVote);
        assert!(!config.record_history);

        let args = Args::parse_from([
            "segdiff-ensemble",
            "--prior",
            "0.25",
            "--init-sensitivity",
            "0.9",
            "--init-specificity",
            "0.8",
            "--staple-history",
        ]);
        let config = staple_config(&args);
        assert_eq!(config.prior, PriorMode::Fixed(0.25));
        assert_eq!(
            config.initialization,
            Initialization::Reliability {
                sensitivity: 0.9,
                specificity: 0.8,
            }
        );
        assert!(config.record_history);

        assert!(Args::try_parse_from(["segdiff-ensemble", "--init-sensitivity", "0.9"]).is_err());
    }

    #[test]
    fn fixed_prior_breaks_the_two_member_tie() {
        let partial = disk(20, 3.0);
        let complete = disk(20, 5.0);
        let ring: Vec<(usize, usize)> = complete
            .indexed_iter()
            .filter(|&(idx, &v)| v == 1.0 && partial[idx] == 0.0)
            .map(|(idx, _)| idx)
            .collect();
        let maps = [partial, complete.clone()];

        let estimated = staple_config(&Args::parse_from(["segdiff-ensemble"]));
        let tied = fusion::staple(&maps, &estimated).unwrap();
        for &idx in &ring {
            assert!((tied.consensus[idx] - 0.5).abs() < 1e-3);
        }

        let fraction = complete.sum() as f64 / complete.len() as f64;
        let fixed = staple_config(&Args::parse_from([
            "segdiff-ensemble".to_string(),
            "--prior".to_string(),
            fraction.to_string(),
        ]));
        let outcome = fusion::staple(&maps, &fixed).unwrap();
        for &idx in &ring {
            assert!(outcome.consensus[idx] > 0.5, "ring pixel {:?}", idx);
        }
    }

    #[test]
    fn cli_defaults() {
        let args = Args::parse_from(["segdiff-ensemble"]);
        assert_eq!(args.num_ensemble, 5);
        assert!(args.clip_denoised);
        assert!(!args.use_ddim);
        assert_eq!(args.seed, 10);

        assert!(Args::try_parse_from(["segdiff-ensemble", "--num-ensemble", "0"]).is_err());
        let args = Args::parse_from(["segdiff-ensemble", "--clip-denoised", "false"]);
        assert!(!args.clip_denoised);
    }
}
