//! Training infrastructure for the LeafSense classifier.
//!
//! This crate provides:
//! - MobileNetV3-Small with a replaceable classification head
//! - The epoch loop with best-accuracy checkpointing
//! - Cosine learning rate scheduling
//! - The end-to-end `train` entry point

pub mod checkpoint;
pub mod lr_schedule;
pub mod model;
pub mod pipeline;
pub mod trainer;

pub use checkpoint::{
    load_metadata, load_model, CheckpointMetadata, CheckpointPaths, CheckpointStore,
    CheckpointWriter,
};
pub use lr_schedule::{LearningRateScheduler, SchedulerType};
pub use model::{
    adapt_classifier, create_model, BackboneProvider, Classifier, MobileNetV3Provider,
    MobileNetV3Small,
};
pub use pipeline::{train, TrainingReport};
pub use trainer::{adamw, BestAccuracy, Trainer, TrainerConfig, TrainingOutcome};

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::{CheckpointMetadata, CheckpointPaths, CheckpointStore};
    pub use super::model::{Classifier, MobileNetV3Small};
    pub use super::pipeline::train;
    pub use super::trainer::{BestAccuracy, Trainer, TrainerConfig};
}
