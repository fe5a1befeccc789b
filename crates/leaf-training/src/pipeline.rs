//! End-to-end training run: dataset, model, loaders, trainer.

use burn::tensor::backend::AutodiffBackend;
use leaf_core::{ClassSet, PipelineConfig, Result, TrainingHistory};
use leaf_dataset::{BatchLoader, LeafData, LoaderConfig, ValidationSource};
use tracing::info;

use crate::checkpoint::{CheckpointPaths, CheckpointStore};
use crate::model::{create_model, MobileNetV3Small};
use crate::trainer::{adamw, BestAccuracy, Trainer, TrainerConfig};

/// Summary of a finished training run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub classes: ClassSet,
    pub validation_source: ValidationSource,
    pub train_samples: usize,
    pub val_samples: usize,
    pub best: BestAccuracy,
    pub checkpoints_written: usize,
    /// Best checkpoint written by this run, `None` if validation never improved
    pub checkpoint: Option<CheckpointPaths>,
    pub history: TrainingHistory,
}

/// Trains a classifier on `config.dataset.root` and keeps the best
/// checkpoint under `config.output.checkpoint_stem()`.
///
/// The configuration and the dataset layout are checked before any model or
/// optimizer state is created. A checkpoint left at the same stem by an
/// earlier run is deleted once the dataset has been scanned.
pub fn train<B: AutodiffBackend>(config: &PipelineConfig, device: &B::Device) -> Result<TrainingReport> {
    config.validate()?;
    let data = LeafData::from_config(&config.dataset)?;
    let classes = data.classes.clone();
    info!("Number of classes: {}", classes.len());

    let dataset = &config.dataset;
    let train_loader = BatchLoader::<B>::new(
        data.train,
        LoaderConfig {
            batch_size: dataset.batch_size,
            num_workers: dataset.num_workers,
            prefetch: dataset.prefetch_batches,
            shuffle_seed: Some(dataset.seed),
        },
        device.clone(),
    )?;
    let val_loader = BatchLoader::<B::InnerBackend>::new(
        data.val,
        LoaderConfig {
            batch_size: dataset.batch_size,
            num_workers: dataset.num_workers,
            prefetch: dataset.prefetch_batches,
            shuffle_seed: None,
        },
        device.clone(),
    )?;
    let train_samples = train_loader.len();
    let val_samples = val_loader.len();

    let model = create_model::<B>(&config.model, classes.len(), device)?;
    let optimizer = adamw::<B, MobileNetV3Small<B>>(config.training.weight_decay);
    let store = CheckpointStore::new(config.output.checkpoint_stem());
    if store.paths().exists() {
        info!(
            "Removing checkpoint of a previous run at {}",
            store.paths().stem().display()
        );
    }
    store.paths().remove()?;

    let mut trainer = Trainer::new(TrainerConfig::from(config), classes.clone(), store);
    let outcome = trainer.fit(model, optimizer, &train_loader, &val_loader)?;
    let store = trainer.into_writer();

    Ok(TrainingReport {
        classes,
        validation_source: data.validation_source,
        train_samples,
        val_samples,
        best: outcome.best,
        checkpoints_written: outcome.checkpoints_written,
        checkpoint: (store.writes() > 0).then(|| store.paths().clone()),
        history: outcome.history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use leaf_core::Error;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_missing_train_dir_fails_before_training() {
        let temp = TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.dataset.root = temp.path().join("nowhere");
        config.output.path = temp.path().join("model.onnx");

        let result = train::<TestBackend>(&config, &Default::default());
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(!CheckpointPaths::new(config.output.checkpoint_stem()).exists());
    }

    #[test]
    fn test_single_class_is_config_error() {
        let temp = TempDir::new().unwrap();
        let class_dir = temp.path().join("train").join("only");
        std::fs::create_dir_all(&class_dir).unwrap();
        image::RgbImage::new(8, 8).save(class_dir.join("0.png")).unwrap();

        let mut config = PipelineConfig::default();
        config.dataset.root = temp.path().to_path_buf();
        config.output.path = temp.path().join("model.onnx");

        let result = train::<TestBackend>(&config, &Default::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_validation_removes_previous_checkpoint() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("dataset");
        for class in ["x", "y"] {
            let train_dir = root.join("train").join(class);
            std::fs::create_dir_all(&train_dir).unwrap();
            std::fs::create_dir_all(root.join("val").join(class)).unwrap();
            for i in 0..2 {
                image::RgbImage::new(8, 8).save(train_dir.join(format!("{i}.png"))).unwrap();
            }
        }

        let mut config = PipelineConfig::default();
        config.dataset.root = root;
        config.dataset.image_size = 16;
        config.dataset.batch_size = 4;
        config.training.epochs = 1;
        config.output.path = temp.path().join("model.onnx");

        let stale = CheckpointPaths::new(config.output.checkpoint_stem());
        for path in [stale.model_file(), stale.optimizer_file(), stale.metadata_file()] {
            std::fs::write(path, b"previous run").unwrap();
        }
        assert!(stale.exists());

        let report = train::<TestBackend>(&config, &Default::default()).unwrap();
        assert_eq!(report.val_samples, 0);
        assert_eq!(report.checkpoints_written, 0);
        assert!(report.checkpoint.is_none());
        assert!(!stale.exists());
        assert!(!stale.model_file().exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.training.epochs = 0;
        let result = train::<TestBackend>(&config, &Default::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
