//! Running loss/accuracy accumulation and per-epoch history.

use serde::{Deserialize, Serialize};

/// Running sums over the batches seen so far in one phase of an epoch.
///
/// Loss is tracked as the sum of per-sample losses so that a final partial
/// batch is weighted by its real size.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMetrics {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl RunningMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one batch given its mean loss, correct predictions and size.
    pub fn update(&mut self, batch_mean_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_mean_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    /// Mean per-sample loss, 0.0 when nothing was seen
    pub fn mean_loss(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.loss_sum / self.total as f64
        }
    }

    /// Accuracy in percent. Undefined when nothing was seen.
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(100.0 * self.correct as f64 / self.total as f64)
        }
    }
}

/// Summary of one completed epoch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochMetrics {
    /// 1-based epoch number
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    /// `None` when the validation set is empty
    pub val_accuracy: Option<f64>,
    /// Learning rate used during this epoch
    pub learning_rate: f64,
}

/// Training metrics tracked during training
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds metrics for an epoch
    pub fn add_epoch(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Gets the best validation accuracy
    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .filter_map(|m| m.val_accuracy)
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Gets the first epoch reaching the best validation accuracy
    pub fn best_epoch(&self) -> Option<usize> {
        let best = self.best_val_accuracy()?;
        self.epochs
            .iter()
            .find(|m| m.val_accuracy == Some(best))
            .map(|m| m.epoch)
    }
}
