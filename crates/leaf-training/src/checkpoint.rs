//! Best-checkpoint persistence.
//!
//! A checkpoint is three files sharing one stem (e.g. `leafsense_model_best`):
//! - `<stem>.mpk`: model record, full precision
//! - `<stem>_optim.mpk`: optimizer record
//! - `<stem>.json`: metadata, including the ordered class list
//!
//! The old metadata is removed before anything else is overwritten, and the
//! new metadata is renamed into place last, so its presence marks a complete
//! checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use chrono::Utc;
use leaf_core::{ClassSet, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Metadata stored next to the model record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    /// 1-based epoch that produced the checkpoint
    pub epoch: usize,
    /// Validation accuracy in percent
    pub best_accuracy: f64,
    /// Learning rate used during that epoch
    pub learning_rate: f64,
    pub classes: ClassSet,
    pub image_size: usize,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        epoch: usize,
        best_accuracy: f64,
        learning_rate: f64,
        classes: ClassSet,
        image_size: usize,
    ) -> Self {
        Self {
            epoch,
            best_accuracy,
            learning_rate,
            classes,
            image_size,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// File locations of one checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    stem: PathBuf,
}

impl CheckpointPaths {
    pub fn new(stem: impl Into<PathBuf>) -> Self {
        Self { stem: stem.into() }
    }

    pub fn stem(&self) -> &Path {
        &self.stem
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.stem.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Model record path handed to the recorder, which appends `.mpk` itself
    fn model_record(&self) -> PathBuf {
        self.stem.clone()
    }

    fn optimizer_record(&self) -> PathBuf {
        self.with_suffix("_optim")
    }

    pub fn model_file(&self) -> PathBuf {
        self.with_suffix(".mpk")
    }

    pub fn optimizer_file(&self) -> PathBuf {
        self.with_suffix("_optim.mpk")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.with_suffix(".json")
    }

    /// Whether a complete checkpoint is present
    pub fn exists(&self) -> bool {
        self.metadata_file().is_file() && self.model_file().is_file()
    }

    /// Deletes every file of this checkpoint. Missing files are ignored.
    pub fn remove(&self) -> Result<()> {
        for path in [
            self.metadata_file(),
            self.model_file(),
            self.optimizer_file(),
        ] {
            remove_if_present(&path)?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Persists the best training state. The training loop calls it only when
/// validation accuracy improves.
pub trait CheckpointWriter {
    fn write<B, M, O>(&mut self, model: &M, optimizer: &O, metadata: &CheckpointMetadata) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>;
}

/// Writes checkpoints to disk, overwriting the previous best
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    paths: CheckpointPaths,
    writes: usize,
}

impl CheckpointStore {
    pub fn new(stem: impl Into<PathBuf>) -> Self {
        Self {
            paths: CheckpointPaths::new(stem),
            writes: 0,
        }
    }

    pub fn paths(&self) -> &CheckpointPaths {
        &self.paths
    }

    /// Checkpoints written by this store
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl CheckpointWriter for CheckpointStore {
    fn write<B, M, O>(&mut self, model: &M, optimizer: &O, metadata: &CheckpointMetadata) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if let Some(parent) = self.paths.stem().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        remove_if_present(&self.paths.metadata_file())?;

        let recorder = CheckpointRecorder::new();
        model
            .clone()
            .save_file(self.paths.model_record(), &recorder)
            .map_err(|e| Error::Checkpoint(format!("Failed to save model record: {e:?}")))?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), self.paths.optimizer_record())
            .map_err(|e| Error::Checkpoint(format!("Failed to save optimizer record: {e:?}")))?;
        save_metadata(&self.paths.metadata_file(), metadata)?;

        self.writes += 1;
        info!(
            "Checkpoint saved to {} (epoch {}, val acc {:.2}%)",
            self.paths.model_file().display(),
            metadata.epoch,
            metadata.best_accuracy
        );
        Ok(())
    }
}

fn save_metadata(path: &Path, metadata: &CheckpointMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {e}")))?;
    let staged = path.with_extension("json.tmp");
    fs::write(&staged, json)?;
    fs::rename(&staged, path)?;
    Ok(())
}

/// Reads checkpoint metadata
pub fn load_metadata(paths: &CheckpointPaths) -> Result<CheckpointMetadata> {
    let json = fs::read_to_string(paths.metadata_file())?;
    serde_json::from_str(&json)
        .map_err(|e| Error::Serialization(format!("Failed to deserialize checkpoint: {e}")))
}

/// Loads the checkpointed parameters into `skeleton`.
pub fn load_model<B: Backend, M: Module<B>>(
    paths: &CheckpointPaths,
    skeleton: M,
    device: &B::Device,
) -> Result<M> {
    let recorder = CheckpointRecorder::new();
    skeleton
        .load_file(paths.model_record(), &recorder, device)
        .map_err(|e| {
            Error::Checkpoint(format!(
                "Failed to load model record {}: {e:?}",
                paths.model_file().display()
            ))
        })
}
