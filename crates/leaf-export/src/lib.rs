//! ONNX export of trained LeafSense classifiers.
//!
//! The exporter never sees the in-memory training model: it rebuilds a fresh
//! network skeleton, loads the best checkpoint into it and converts that to a
//! static inference graph. The ordered class list is written next to the
//! model so that output index `i` maps to line `i`.

pub mod graph;
pub mod onnx;

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use leaf_core::{ClassSet, Error, PipelineConfig, Result};
use leaf_training::checkpoint::{load_metadata, load_model, CheckpointMetadata, CheckpointPaths};
use leaf_training::model::MobileNetV3Small;
use leaf_training::TrainingReport;
use tracing::info;

pub use graph::{build_graph, GraphBuilder, BATCH_PARAM, INPUT_NAME, OUTPUT_NAME};
pub use onnx::{ModelProto, IR_VERSION, OPSET_VERSION};

const PRODUCER_NAME: &str = "leafsense";

/// Files written by an export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub model_path: PathBuf,
    pub class_file: PathBuf,
    pub num_classes: usize,
}

/// Converts the best checkpoint into an ONNX model plus class file.
#[derive(Debug, Clone)]
pub struct Exporter {
    checkpoint: CheckpointPaths,
    output: PathBuf,
    class_file: PathBuf,
    dropout: f64,
}

impl Exporter {
    pub fn new(checkpoint: CheckpointPaths, output: impl Into<PathBuf>, class_file: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint,
            output: output.into(),
            class_file: class_file.into(),
            dropout: 0.0,
        }
    }

    /// Exporter for the checkpoint and artifact paths derived from `config.output`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            dropout: config.model.dropout,
            ..Self::new(
                CheckpointPaths::new(config.output.checkpoint_stem()),
                config.output.path.clone(),
                config.output.class_file(),
            )
        }
    }

    /// Exporter for the checkpoint written by the run behind `report`.
    ///
    /// Fails when that run never wrote one, whatever is on disk.
    pub fn from_report(config: &PipelineConfig, report: &TrainingReport) -> Result<Self> {
        let checkpoint = report.checkpoint.clone().ok_or_else(|| {
            Error::ExportPrecondition(
                "training never improved on validation, no checkpoint was written".into(),
            )
        })?;
        Ok(Self {
            checkpoint,
            ..Self::from_config(config)
        })
    }

    pub fn checkpoint(&self) -> &CheckpointPaths {
        &self.checkpoint
    }

    /// Loads the checkpoint into a fresh skeleton and builds the ONNX model.
    pub fn convert<B: Backend>(&self, device: &B::Device) -> Result<(ModelProto, CheckpointMetadata)> {
        if !self.checkpoint.exists() {
            return Err(Error::ExportPrecondition(format!(
                "no checkpoint at {}, training never improved on validation",
                self.checkpoint.model_file().display()
            )));
        }

        let metadata = load_metadata(&self.checkpoint)?;
        let skeleton = MobileNetV3Small::<B>::new(metadata.classes.len(), self.dropout, device);
        let model = load_model(&self.checkpoint, skeleton, device)?;
        info!(
            "Loaded checkpoint from epoch {} (val acc {:.2}%)",
            metadata.epoch, metadata.best_accuracy
        );

        let graph = build_graph(&model, metadata.image_size)?;
        let model = ModelProto {
            ir_version: IR_VERSION,
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            domain: String::new(),
            model_version: 1,
            doc_string: String::new(),
            graph: Some(graph),
            opset_import: vec![onnx::OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
        };
        Ok((model, metadata))
    }

    /// Writes the ONNX model and the class file.
    pub fn export<B: Backend>(&self, device: &B::Device) -> Result<ExportArtifact> {
        let (model, metadata) = self.convert::<B>(device)?;

        create_parent(&self.output)?;
        fs::write(&self.output, model.to_bytes())
            .map_err(|e| Error::Export(format!("Failed to write {}: {e}", self.output.display())))?;
        write_class_file(&self.class_file, &metadata.classes)?;

        info!("Model exported to {}", self.output.display());
        info!("Class names saved to {}", self.class_file.display());

        Ok(ExportArtifact {
            model_path: self.output.clone(),
            class_file: self.class_file.clone(),
            num_classes: metadata.classes.len(),
        })
    }
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(fs::create_dir_all(parent)?),
        _ => Ok(()),
    }
}

/// One class name per line in label order, newline-terminated.
pub fn write_class_file(path: &Path, classes: &ClassSet) -> Result<()> {
    create_parent(path)?;
    let mut contents = String::new();
    for name in classes.iter() {
        contents.push_str(name);
        contents.push('\n');
    }
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    #[test]
    fn test_missing_checkpoint_is_precondition_error() {
        let temp = TempDir::new().unwrap();
        let exporter = Exporter::new(
            CheckpointPaths::new(temp.path().join("model_best")),
            temp.path().join("model.onnx"),
            temp.path().join("model_classes.txt"),
        );
        let result = exporter.export::<NdArray>(&Default::default());
        assert!(matches!(result, Err(Error::ExportPrecondition(_))));
        assert!(!temp.path().join("model.onnx").exists());
    }

    #[test]
    fn test_class_file_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out").join("classes.txt");
        let classes = ClassSet::from_directory_names(["pest_damage", "healthy", "disease"]).unwrap();
        write_class_file(&path, &classes).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "disease\nhealthy\npest_damage\n"
        );
    }

    fn report(checkpoint: Option<CheckpointPaths>) -> TrainingReport {
        TrainingReport {
            classes: ClassSet::from_directory_names(["x", "y", "z"]).unwrap(),
            validation_source: leaf_dataset::ValidationSource::Directory,
            train_samples: 6,
            val_samples: 0,
            best: Default::default(),
            checkpoints_written: checkpoint.iter().count(),
            checkpoint,
            history: Default::default(),
        }
    }

    #[test]
    fn test_report_without_checkpoint_is_precondition_error() {
        let mut config = PipelineConfig::default();
        config.output.path = PathBuf::from("models/leaf.onnx");
        let result = Exporter::from_report(&config, &report(None));
        assert!(matches!(result, Err(Error::ExportPrecondition(_))));
    }

    #[test]
    fn test_report_checkpoint_is_used() {
        let mut config = PipelineConfig::default();
        config.output.path = PathBuf::from("models/leaf.onnx");
        let written = CheckpointPaths::new("runs/leaf_best");
        let exporter = Exporter::from_report(&config, &report(Some(written.clone()))).unwrap();
        assert_eq!(exporter.checkpoint(), &written);
        assert_eq!(exporter.output, PathBuf::from("models/leaf.onnx"));
    }

    #[test]
    fn test_paths_from_config() {
        let mut config = PipelineConfig::default();
        config.output.path = PathBuf::from("models/leaf.onnx");
        let exporter = Exporter::from_config(&config);
        assert_eq!(exporter.checkpoint().stem(), Path::new("models/leaf_best"));
        assert_eq!(exporter.class_file, PathBuf::from("models/leaf_classes.txt"));
    }
}
