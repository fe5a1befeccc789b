//! Configuration structures for the training pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete pipeline configuration, usually loaded from a TOML file and then
/// overridden from the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dataset and loader configuration
    pub dataset: DatasetConfig,
    /// Training hyperparameters
    pub training: TrainingParams,
    /// Model configuration
    pub model: ModelConfig,
    /// Output artifact configuration
    pub output: OutputConfig,
}

impl PipelineConfig {
    /// Checks value ranges. Called before any training state is created.
    pub fn validate(&self) -> Result<()> {
        if self.dataset.image_size == 0 {
            return Err(Error::Config("image_size must be positive".into()));
        }
        if self.dataset.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.dataset.num_workers == 0 {
            return Err(Error::Config("num_workers must be positive".into()));
        }
        if self.dataset.prefetch_batches == 0 {
            return Err(Error::Config("prefetch_batches must be positive".into()));
        }
        let fraction = self.dataset.validation_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(Error::Config(format!(
                "validation_fraction must be in (0, 1), got {fraction}"
            )));
        }
        if self.training.epochs == 0 {
            return Err(Error::Config("epochs must be positive".into()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.training.learning_rate
            )));
        }
        if self.training.weight_decay < 0.0 {
            return Err(Error::Config("weight_decay must not be negative".into()));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        if self.model.pretrained && self.model.pretrained_weights.is_none() {
            return Err(Error::Config(
                "pretrained weights requested but no weights file configured".into(),
            ));
        }
        Ok(())
    }
}

/// Dataset and data loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Dataset root containing `train/` and optionally `val/`
    pub root: PathBuf,
    /// Target square image size S
    pub image_size: usize,
    /// Batch size
    pub batch_size: usize,
    /// Number of sample loading workers
    pub num_workers: usize,
    /// Decoded batches kept ahead of the training loop
    pub prefetch_batches: usize,
    /// Share of the training partition held out when no `val/` exists
    pub validation_fraction: f64,
    /// Seed for the fallback split and the epoch shuffles
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./dataset"),
            image_size: 224,
            batch_size: 32,
            num_workers: 4,
            prefetch_batches: 2,
            validation_fraction: 0.2,
            seed: 42,
        }
    }
}

impl DatasetConfig {
    pub fn train_dir(&self) -> PathBuf {
        self.root.join("train")
    }

    pub fn val_dir(&self) -> PathBuf {
        self.root.join("val")
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of training epochs (also the cosine annealing horizon)
    pub epochs: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// AdamW weight decay
    pub weight_decay: f64,
    /// Progress is logged every `log_every` batches
    pub log_every: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.001,
            weight_decay: 0.01,
            log_every: 10,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Whether to initialize the backbone from pretrained weights
    pub pretrained: bool,
    /// Burn record of the 1000-class ImageNet backbone
    pub pretrained_weights: Option<PathBuf>,
    /// Dropout before the final projection
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            pretrained: false,
            pretrained_weights: None,
            dropout: 0.2,
        }
    }
}

/// Output artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Path of the exported ONNX model
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("leafsense_model.onnx"),
        }
    }
}

impl OutputConfig {
    /// Stem of every checkpoint file: the output path without its extension,
    /// suffixed with `_best`.
    pub fn checkpoint_stem(&self) -> PathBuf {
        with_suffix(&self.path, "_best")
    }

    /// Class list written next to the exported model.
    pub fn class_file(&self) -> PathBuf {
        let mut path = with_suffix(&self.path, "_classes");
        path.set_extension("txt");
        path
    }
}

/// Drops the extension of `path` and appends `suffix` to the file stem.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{suffix}"))
}
