//! Epoch-level training loop.
//!
//! Every epoch runs four phases in order: training, validation, learning-rate
//! scheduling and checkpointing. The best validation accuracy is threaded
//! through the loop as a value, and a checkpoint is written only when it
//! strictly improves.

use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use leaf_core::{ClassSet, EpochMetrics, PipelineConfig, Result, RunningMetrics, TrainingHistory};
use leaf_dataset::BatchLoader;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointMetadata, CheckpointWriter};
use crate::lr_schedule::{LearningRateScheduler, SchedulerType};
use crate::model::Classifier;

/// Best validation accuracy seen so far. Starts as "no best", which any
/// defined accuracy beats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BestAccuracy(Option<f64>);

impl BestAccuracy {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn value(&self) -> Option<f64> {
        self.0
    }

    /// Compares `candidate` with the current best and returns the new best
    /// together with whether it strictly improved. An undefined candidate
    /// never improves.
    pub fn observe(self, candidate: Option<f64>) -> (Self, bool) {
        match (candidate, self.0) {
            (None, _) => (self, false),
            (Some(accuracy), None) => (Self(Some(accuracy)), true),
            (Some(accuracy), Some(best)) if accuracy > best => (Self(Some(accuracy)), true),
            _ => (self, false),
        }
    }
}

/// Phase of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Training,
    Validating,
    Scheduling,
    Checkpointing,
}

/// Configuration for the trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub log_every: usize,
    pub image_size: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for TrainerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            epochs: config.training.epochs,
            learning_rate: config.training.learning_rate,
            weight_decay: config.training.weight_decay,
            log_every: config.training.log_every,
            image_size: config.dataset.image_size,
        }
    }
}

/// AdamW with decoupled weight decay
pub fn adamw<B, M>(weight_decay: f64) -> impl Optimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    AdamWConfig::new()
        .with_weight_decay(weight_decay as f32)
        .init::<B, M>()
}

/// Result of a completed run
#[derive(Debug)]
pub struct TrainingOutcome<M> {
    /// Model after the last epoch (not necessarily the best one)
    pub model: M,
    pub best: BestAccuracy,
    pub history: TrainingHistory,
    pub checkpoints_written: usize,
}

/// Drives the epochs and owns the checkpoint writer
pub struct Trainer<W> {
    config: TrainerConfig,
    classes: ClassSet,
    writer: W,
}

impl<W: CheckpointWriter> Trainer<W> {
    pub fn new(config: TrainerConfig, classes: ClassSet, writer: W) -> Self {
        Self {
            config,
            classes,
            writer,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Runs all epochs.
    pub fn fit<B, M, O>(
        &mut self,
        mut model: M,
        mut optimizer: O,
        train: &BatchLoader<B>,
        val: &BatchLoader<B::InnerBackend>,
    ) -> Result<TrainingOutcome<M>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Classifier<B>,
        M::InnerModule: Classifier<B::InnerBackend>,
        O: Optimizer<M, B>,
    {
        let epochs = self.config.epochs;
        let mut scheduler =
            LearningRateScheduler::new(SchedulerType::cosine(epochs), self.config.learning_rate);
        let mut best = BestAccuracy::none();
        let mut history = TrainingHistory::new();
        let mut checkpoints_written = 0;

        for epoch in 1..=epochs {
            let learning_rate = scheduler.get_lr();
            info!("Epoch {epoch}/{epochs} (lr = {learning_rate:.6})");

            debug!("{:?}", EpochPhase::Training);
            let (trained, train_metrics) =
                self.train_epoch(model, &mut optimizer, train, epoch, learning_rate)?;
            model = trained;

            debug!("{:?}", EpochPhase::Validating);
            let val_metrics = self.validate(&model.valid(), val, epoch)?;

            debug!("{:?}", EpochPhase::Scheduling);
            scheduler.step();

            debug!("{:?}", EpochPhase::Checkpointing);
            let val_accuracy = val_metrics.accuracy();
            let (new_best, improved) = self.checkpoint_epoch::<B, M, O>(
                best,
                epoch,
                val_accuracy,
                learning_rate,
                &model,
                &optimizer,
            )?;
            best = new_best;
            checkpoints_written += improved as usize;

            let metrics = EpochMetrics {
                epoch,
                train_loss: train_metrics.mean_loss(),
                train_accuracy: train_metrics.accuracy().unwrap_or(0.0),
                val_loss: val_metrics.mean_loss(),
                val_accuracy,
                learning_rate,
            };
            info!(
                "Epoch {epoch}/{epochs}: train loss {:.4}, train acc {:.2}% | val loss {:.4}, val acc {}{}",
                metrics.train_loss,
                metrics.train_accuracy,
                metrics.val_loss,
                format_accuracy(val_accuracy),
                if improved { " (best)" } else { "" }
            );
            history.add_epoch(metrics);
        }

        match best.value() {
            Some(accuracy) => info!("Best validation accuracy: {accuracy:.2}%"),
            None => info!("No validation accuracy was measured, no checkpoint written"),
        }

        Ok(TrainingOutcome {
            model,
            best,
            history,
            checkpoints_written,
        })
    }

    /// Checkpointing phase of one epoch. Writes a checkpoint iff `val_accuracy`
    /// strictly beats `best`, and returns the new best with that decision.
    pub fn checkpoint_epoch<B, M, O>(
        &mut self,
        best: BestAccuracy,
        epoch: usize,
        val_accuracy: Option<f64>,
        learning_rate: f64,
        model: &M,
        optimizer: &O,
    ) -> Result<(BestAccuracy, bool)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let (best, improved) = best.observe(val_accuracy);
        if let (true, Some(accuracy)) = (improved, val_accuracy) {
            let metadata = CheckpointMetadata::new(
                epoch,
                accuracy,
                learning_rate,
                self.classes.clone(),
                self.config.image_size,
            );
            self.writer.write::<B, M, O>(model, optimizer, &metadata)?;
        }
        Ok((best, improved))
    }

    /// One pass over the training loader with a gradient step per batch.
    pub fn train_epoch<B, M, O>(
        &self,
        mut model: M,
        optimizer: &mut O,
        loader: &BatchLoader<B>,
        epoch: usize,
        learning_rate: f64,
    ) -> Result<(M, RunningMetrics)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Classifier<B>,
        O: Optimizer<M, B>,
    {
        let num_batches = loader.num_batches();
        let mut metrics = RunningMetrics::new();

        for (batch_idx, batch) in loader.iter(epoch).enumerate() {
            let batch = batch?;
            let batch_size = batch.targets.dims()[0];

            let output = model.forward(batch.images);
            let loss = CrossEntropyLossConfig::new()
                .init(&output.device())
                .forward(output.clone(), batch.targets.clone());
            let loss_value: f64 = loss.clone().into_scalar().elem();
            let correct = count_correct(output, batch.targets);
            metrics.update(loss_value, correct, batch_size);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(learning_rate, model, grads);

            let log_every = self.config.log_every;
            if log_every > 0 && (batch_idx + 1) % log_every == 0 {
                info!(
                    "  Batch {:>4}/{}: loss = {:.4}, acc = {}",
                    batch_idx + 1,
                    num_batches,
                    loss_value,
                    format_accuracy(metrics.accuracy())
                );
            }
        }

        Ok((model, metrics))
    }

    /// Forward-only pass over the validation loader.
    pub fn validate<B, M>(&self, model: &M, loader: &BatchLoader<B>, epoch: usize) -> Result<RunningMetrics>
    where
        B: Backend,
        M: Classifier<B>,
    {
        let mut metrics = RunningMetrics::new();

        for batch in loader.iter(epoch) {
            let batch = batch?;
            let batch_size = batch.targets.dims()[0];

            let output = model.forward(batch.images);
            let loss = CrossEntropyLossConfig::new()
                .init(&output.device())
                .forward(output.clone(), batch.targets.clone());
            let loss_value: f64 = loss.into_scalar().elem();
            metrics.update(loss_value, count_correct(output, batch.targets), batch_size);
        }

        Ok(metrics)
    }
}

/// Number of rows whose arg-max matches the target
pub fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

fn format_accuracy(accuracy: Option<f64>) -> String {
    accuracy
        .map(|a| format!("{a:.2}%"))
        .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MobileNetV3Small;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;
    use leaf_core::{Error, ImageSample};
    use leaf_dataset::{AugmentationPolicy, LeafDataset, LoaderConfig};
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    const SIZE: usize = 16;

    /// Counts writes without touching the filesystem
    #[derive(Default)]
    struct CountingWriter {
        epochs: Vec<usize>,
    }

    impl CheckpointWriter for CountingWriter {
        fn write<B, M, O>(&mut self, _: &M, _: &O, metadata: &CheckpointMetadata) -> Result<()>
        where
            B: AutodiffBackend,
            M: AutodiffModule<B>,
            O: Optimizer<M, B>,
        {
            self.epochs.push(metadata.epoch);
            Ok(())
        }
    }

    fn samples(dir: &Path, count: usize) -> Vec<ImageSample> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("{i}.png"));
                let shade = if i % 2 == 0 { 30u8 } else { 220u8 };
                image::ImageBuffer::from_pixel(20, 20, image::Rgb([shade, 255 - shade, 90u8]))
                    .save(&path)
                    .unwrap();
                ImageSample::new(path, i % 2)
            })
            .collect()
    }

    fn loader<B: Backend>(samples: Vec<ImageSample>, train: bool) -> BatchLoader<B> {
        let (train_policy, eval_policy) = AugmentationPolicy::transforms(SIZE as u32);
        let policy = if train { train_policy } else { eval_policy };
        let config = LoaderConfig {
            batch_size: 4,
            num_workers: 2,
            prefetch: 2,
            shuffle_seed: train.then_some(1),
        };
        BatchLoader::new(LeafDataset::new(samples, policy), config, Default::default()).unwrap()
    }

    fn trainer(epochs: usize) -> Trainer<CountingWriter> {
        let config = TrainerConfig {
            epochs,
            learning_rate: 0.001,
            weight_decay: 0.01,
            log_every: 1,
            image_size: SIZE,
        };
        let classes = ClassSet::from_directory_names(["a", "b"]).unwrap();
        Trainer::new(config, classes, CountingWriter::default())
    }

    #[test]
    fn test_best_accuracy_threading() {
        let best = BestAccuracy::none();
        let (best, improved) = best.observe(None);
        assert!(!improved);
        assert_eq!(best.value(), None);

        let (best, improved) = best.observe(Some(0.0));
        assert!(improved);
        let (best, improved) = best.observe(Some(0.0));
        assert!(!improved);
        let (best, improved) = best.observe(Some(40.0));
        assert!(improved);
        let (best, improved) = best.observe(None);
        assert!(!improved);
        assert_eq!(best.value(), Some(40.0));
    }

    #[test]
    fn test_no_improvement_after_first_epoch_gives_one_write() {
        let device = Default::default();
        let model = MobileNetV3Small::<TestBackend>::new(2, 0.2, &device);
        let optimizer = adamw::<TestBackend, MobileNetV3Small<TestBackend>>(0.01);
        let mut trainer = trainer(4);

        let accuracies = [Some(50.0), Some(50.0), Some(25.0), Some(50.0)];
        let mut best = BestAccuracy::none();
        for (i, accuracy) in accuracies.into_iter().enumerate() {
            let (next, _) = trainer
                .checkpoint_epoch::<TestBackend, _, _>(best, i + 1, accuracy, 0.001, &model, &optimizer)
                .unwrap();
            best = next;
        }

        assert_eq!(trainer.writer().epochs, vec![1]);
        assert_eq!(best.value(), Some(50.0));
    }

    #[test]
    fn test_checkpoint_epoch_writes_only_on_strict_improvement() {
        let device = Default::default();
        let model = MobileNetV3Small::<TestBackend>::new(2, 0.2, &device);
        let optimizer = adamw::<TestBackend, MobileNetV3Small<TestBackend>>(0.01);
        let mut trainer = trainer(5);

        let accuracies = [None, Some(25.0), Some(25.0), None, Some(75.0)];
        let mut best = BestAccuracy::none();
        let mut decisions = Vec::new();
        for (i, accuracy) in accuracies.into_iter().enumerate() {
            let (next, improved) = trainer
                .checkpoint_epoch::<TestBackend, _, _>(best, i + 1, accuracy, 0.001, &model, &optimizer)
                .unwrap();
            best = next;
            decisions.push(improved);
        }

        assert_eq!(decisions, vec![false, true, false, false, true]);
        assert_eq!(trainer.writer().epochs, vec![2, 5]);
    }

    #[test]
    fn test_fit_writes_exactly_on_improving_epochs() {
        let temp = TempDir::new().unwrap();
        let all = samples(temp.path(), 12);
        let train = loader::<TestBackend>(all[..8].to_vec(), true);
        let val = loader::<NdArray>(all[8..].to_vec(), false);

        let device = Default::default();
        let model = MobileNetV3Small::<TestBackend>::new(2, 0.2, &device);
        let optimizer = adamw::<TestBackend, MobileNetV3Small<TestBackend>>(0.01);

        let mut trainer = trainer(3);
        let outcome = trainer.fit(model, optimizer, &train, &val).unwrap();

        let mut best = BestAccuracy::none();
        let mut expected = Vec::new();
        for metrics in &outcome.history.epochs {
            let (next, improved) = best.observe(metrics.val_accuracy);
            best = next;
            if improved {
                expected.push(metrics.epoch);
            }
        }

        assert_eq!(trainer.writer().epochs.first(), Some(&1));
        assert_eq!(trainer.writer().epochs, expected);
        assert_eq!(outcome.checkpoints_written, expected.len());
        assert_eq!(outcome.best, best);
    }

    #[test]
    fn test_count_correct() {
        let device = Default::default();
        let output = Tensor::<NdArray, 2>::from_data(
            TensorData::new(vec![0.9f32, 0.1, 0.2, 0.8, 0.7, 0.3], [3, 2]),
            &device,
        );
        let targets =
            Tensor::<NdArray, 1, Int>::from_data(TensorData::new(vec![0i64, 1, 1], [3]), &device);
        assert_eq!(count_correct(output, targets), 2);
    }

    #[test]
    fn test_fit_single_epoch_writes_one_checkpoint() {
        let temp = TempDir::new().unwrap();
        let all = samples(temp.path(), 12);
        let train = loader::<TestBackend>(all[..8].to_vec(), true);
        let val = loader::<NdArray>(all[8..].to_vec(), false);

        let device = Default::default();
        let model = MobileNetV3Small::<TestBackend>::new(2, 0.2, &device);
        let optimizer = adamw::<TestBackend, MobileNetV3Small<TestBackend>>(0.01);

        let mut trainer = trainer(1);
        let outcome = trainer.fit(model, optimizer, &train, &val).unwrap();

        assert_eq!(outcome.checkpoints_written, 1);
        assert_eq!(trainer.writer().epochs, vec![1]);
        assert!(outcome.best.value().is_some());
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.model.num_classes(), 2);
    }

    #[test]
    fn test_empty_validation_never_checkpoints() {
        let temp = TempDir::new().unwrap();
        let train = loader::<TestBackend>(samples(temp.path(), 4), true);
        let val = loader::<NdArray>(Vec::new(), false);

        let device = Default::default();
        let model = MobileNetV3Small::<TestBackend>::new(2, 0.2, &device);
        let optimizer = adamw::<TestBackend, MobileNetV3Small<TestBackend>>(0.01);

        let mut trainer = trainer(2);
        let outcome = trainer.fit(model, optimizer, &train, &val).unwrap();

        assert_eq!(outcome.checkpoints_written, 0);
        assert!(trainer.writer().epochs.is_empty());
        assert_eq!(outcome.best.value(), None);
        assert_eq!(outcome.history.len(), 2);
    }

    #[test]
    fn test_sample_error_aborts_fit() {
        let temp = TempDir::new().unwrap();
        let mut train_samples = samples(temp.path(), 4);
        let broken = temp.path().join("broken.png");
        std::fs::write(&broken, b"not an image").unwrap();
        train_samples.push(ImageSample::new(broken, 0));

        let train = loader::<TestBackend>(train_samples, true);
        let val = loader::<NdArray>(Vec::new(), false);

        let device = Default::default();
        let model = MobileNetV3Small::<TestBackend>::new(2, 0.2, &device);
        let optimizer = adamw::<TestBackend, MobileNetV3Small<TestBackend>>(0.01);

        let result = trainer(1).fit(model, optimizer, &train, &val);
        assert!(matches!(result, Err(Error::Sample { .. })));
    }
}
