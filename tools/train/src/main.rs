//! LeafSense training CLI
//!
//! Trains the plant health classifier on a class-folder dataset and exports
//! the best checkpoint to ONNX. Without a subcommand the full pipeline runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use leaf_core::{
    load_pipeline_config, select_device, setup_cli_logging, ComputeBackend, PipelineConfig,
    TrainingBackend,
};
use leaf_dataset::{generate, SyntheticSpec};
use leaf_export::Exporter;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

/// LeafSense plant health classifier
#[derive(Parser, Debug)]
#[command(
    name = "leafsense-train",
    about = "Train and export the LeafSense plant health classifier",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    train: TrainArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model and export the best checkpoint (default)
    Train(TrainArgs),
    /// Re-export an existing checkpoint
    Export(ExportArgs),
    /// Generate a synthetic class-folder dataset
    Synth(SynthArgs),
}

#[derive(Args, Debug, Default)]
struct TrainArgs {
    /// Pipeline configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Dataset root containing train/ and optionally val/
    #[arg(short, long, value_name = "DIR")]
    dataset: Option<PathBuf>,

    /// Number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Initial learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Output ONNX path
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Sample loading workers
    #[arg(short, long, value_name = "N")]
    workers: Option<usize>,

    /// Seed for the fallback split and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Burn record of the ImageNet backbone
    #[arg(long, value_name = "FILE")]
    pretrained_weights: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Pipeline configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output ONNX path; the checkpoint is looked up next to it
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct SynthArgs {
    /// Dataset root to create
    #[arg(short, long, value_name = "DIR", default_value = "./dataset")]
    output: PathBuf,

    /// Training images per class
    #[arg(long, default_value_t = 50)]
    train_per_class: usize,

    /// Validation images per class (0 skips val/)
    #[arg(long, default_value_t = 10)]
    val_per_class: usize,

    /// Image side length
    #[arg(long, default_value_t = 224)]
    image_size: u32,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Train(args)) => run_train(args),
        Some(Command::Export(args)) => run_export(args),
        Some(Command::Synth(args)) => run_synth(args),
        None => run_train(cli.train),
    }
}

fn apply_overrides(config: &mut PipelineConfig, args: &TrainArgs) {
    if let Some(dataset) = &args.dataset {
        config.dataset.root = dataset.clone();
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(lr) = args.lr {
        config.training.learning_rate = lr;
    }
    if let Some(output) = &args.output {
        config.output.path = output.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.dataset.batch_size = batch_size;
    }
    if let Some(workers) = args.workers {
        config.dataset.num_workers = workers;
    }
    if let Some(seed) = args.seed {
        config.dataset.seed = seed;
    }
    if let Some(weights) = &args.pretrained_weights {
        config.model.pretrained = true;
        config.model.pretrained_weights = Some(weights.clone());
    }
}

fn print_config_summary(config: &PipelineConfig) {
    info!("");
    info!("Configuration Summary:");
    info!("  Dataset: {}", config.dataset.root.display());
    info!("  Image size: {}", config.dataset.image_size);
    info!("  Epochs: {}", config.training.epochs);
    info!("  Batch size: {}", config.dataset.batch_size);
    info!("  Learning rate: {}", config.training.learning_rate);
    info!("  Weight decay: {}", config.training.weight_decay);
    info!("  Workers: {}", config.dataset.num_workers);
    info!("  Pretrained: {}", config.model.pretrained);
    info!("  Output: {}", config.output.path.display());
    info!("");
}

fn run_train(args: TrainArgs) -> Result<()> {
    setup_cli_logging(args.verbose)?;

    info!("LeafSense - Plant Health Classifier Training");
    info!("============================================");

    let mut config =
        load_pipeline_config(args.config.as_deref()).context("Failed to load configuration")?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;
    print_config_summary(&config);

    let (kind, device) = select_device();
    info!("Using device: {kind}");

    let report = leaf_training::train::<TrainingBackend>(&config, &device)
        .context("Training failed")?;

    info!("");
    info!("Training Summary:");
    info!("  Classes: {}", report.classes.names().join(", "));
    info!("  Training samples: {}", report.train_samples);
    info!("  Validation samples: {}", report.val_samples);
    match report.best.value() {
        Some(accuracy) => info!("  Best validation accuracy: {accuracy:.2}%"),
        None => info!("  Best validation accuracy: n/a"),
    }
    info!("  Checkpoints written: {}", report.checkpoints_written);

    let artifact = Exporter::from_report(&config, &report)
        .and_then(|exporter| exporter.export::<ComputeBackend>(&device))
        .context("Export failed")?;
    info!(
        "Exported {} classes to {}",
        artifact.num_classes,
        artifact.model_path.display()
    );

    Ok(())
}

fn run_export(args: ExportArgs) -> Result<()> {
    setup_cli_logging(args.verbose)?;

    let mut config =
        load_pipeline_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(output) = args.output {
        config.output.path = output;
    }

    let (kind, device) = select_device();
    info!("Using device: {kind}");

    let artifact = Exporter::from_config(&config)
        .export::<ComputeBackend>(&device)
        .context("Export failed")?;
    info!(
        "Exported {} classes to {}",
        artifact.num_classes,
        artifact.model_path.display()
    );
    Ok(())
}

fn run_synth(args: SynthArgs) -> Result<()> {
    setup_cli_logging(args.verbose)?;

    let spec = SyntheticSpec {
        train_per_class: args.train_per_class,
        val_per_class: args.val_per_class,
        image_size: args.image_size,
        ..SyntheticSpec::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let written = generate(&args.output, &spec, &mut rng).with_context(|| {
        format!("Failed to generate dataset in {}", args.output.display())
    })?;

    info!(
        "Synthetic dataset created at {} ({} images)",
        args.output.display(),
        written.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_without_subcommand_train() {
        let cli = Cli::try_parse_from(["leafsense-train", "--dataset", "data", "--epochs", "3"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.train.dataset, Some(PathBuf::from("data")));
        assert_eq!(cli.train.epochs, Some(3));
    }

    #[test]
    fn test_overrides_applied() {
        let args = TrainArgs {
            epochs: Some(5),
            lr: Some(0.01),
            workers: Some(2),
            pretrained_weights: Some(PathBuf::from("mobilenet.mpk")),
            ..TrainArgs::default()
        };
        let mut config = PipelineConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.dataset.num_workers, 2);
        assert!(config.model.pretrained);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_export_subcommand() {
        let cli = Cli::try_parse_from(["leafsense-train", "export", "--output", "m.onnx"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Export(ref a)) if a.output == Some(PathBuf::from("m.onnx"))));
    }
}
