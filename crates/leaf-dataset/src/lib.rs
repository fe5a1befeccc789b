//! Class-folder dataset loading and augmentation for LeafSense.
//!
//! This crate discovers the label set from a `train/<class>/` tree, splits off
//! a validation set when none is provided, and turns image files into
//! normalized tensors through the train or eval augmentation policy.

pub mod augmentation;
pub mod dataset;
pub mod folder;
pub mod loader;
pub mod split;
pub mod synthetic;

pub use augmentation::{AugmentationConfig, AugmentationPolicy, TransformMode};
pub use dataset::{LeafBatch, LeafBatcher, LeafData, LeafDataset, LeafItem, ValidationSource};
pub use folder::{discover_classes, ImageFolder};
pub use loader::{BatchIter, BatchLoader, LoaderConfig};
pub use split::split_indices;
pub use synthetic::{generate, SyntheticSpec};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::augmentation::*;
    pub use crate::dataset::*;
    pub use crate::folder::*;
    pub use crate::loader::*;
    pub use crate::split::*;
}
