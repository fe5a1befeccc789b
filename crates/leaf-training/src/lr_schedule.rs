//! Learning rate scheduling strategies.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Learning rate scheduler type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SchedulerType {
    /// Cosine annealing: cosine decay from the base LR to `eta_min` over `t_max` epochs
    CosineAnnealingLR { t_max: usize, eta_min: f64 },
}

impl SchedulerType {
    /// Cosine annealing to zero over `epochs`
    pub fn cosine(epochs: usize) -> Self {
        Self::CosineAnnealingLR {
            t_max: epochs,
            eta_min: 0.0,
        }
    }
}

/// Learning rate scheduler, stepped once per epoch
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    scheduler_type: SchedulerType,
    base_lr: f64,
    current_lr: f64,
    current_epoch: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_lr: base_lr,
            current_epoch: 0,
        }
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Step the scheduler (call at the end of each epoch)
    pub fn step(&mut self) {
        self.current_epoch += 1;

        match &self.scheduler_type {
            SchedulerType::CosineAnnealingLR { t_max, eta_min } => {
                let progress = if *t_max == 0 {
                    1.0
                } else {
                    (self.current_epoch as f64 / *t_max as f64).min(1.0)
                };
                self.current_lr =
                    eta_min + (self.base_lr - eta_min) * (1.0 + (progress * PI).cos()) / 2.0;
            }
        }
    }

    /// Get the current epoch
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_annealing_to_zero() {
        let mut scheduler = LearningRateScheduler::new(SchedulerType::cosine(10), 0.001);
        assert_eq!(scheduler.get_lr(), 0.001);

        for _ in 0..5 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.0005).abs() < 1e-12);
        assert_eq!(scheduler.current_epoch(), 5);

        for _ in 0..5 {
            scheduler.step();
        }
        assert!(scheduler.get_lr().abs() < 1e-12);
    }

    #[test]
    fn test_cosine_matches_closed_form() {
        let epochs = 20;
        let mut scheduler = LearningRateScheduler::new(SchedulerType::cosine(epochs), 0.01);
        for e in 1..=epochs {
            scheduler.step();
            let expected = 0.01 * (1.0 + (PI * e as f64 / epochs as f64).cos()) / 2.0;
            assert!((scheduler.get_lr() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cosine_with_eta_min() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::CosineAnnealingLR {
                t_max: 4,
                eta_min: 0.0001,
            },
            0.001,
        );
        for _ in 0..6 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.0001).abs() < 1e-12);
    }
}
