//! Burn dataset and batcher for class-folder leaf images.

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::ImageReader;
use leaf_core::{ClassSet, DatasetConfig, Error, ImageSample, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{error, info};

use crate::augmentation::{AugmentationConfig, AugmentationPolicy};
use crate::folder::ImageFolder;
use crate::split::split_indices;

/// A single transformed sample
#[derive(Clone, Debug)]
pub struct LeafItem {
    /// Normalized image as flattened CHW values `[3 * S * S]`
    pub image: Vec<f32>,
    pub label: usize,
}

/// Lazily decoded samples paired with the transform applied on access.
#[derive(Debug, Clone)]
pub struct LeafDataset {
    samples: Vec<ImageSample>,
    policy: AugmentationPolicy,
}

impl LeafDataset {
    pub fn new(samples: Vec<ImageSample>, policy: AugmentationPolicy) -> Self {
        Self { samples, policy }
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn policy(&self) -> &AugmentationPolicy {
        &self.policy
    }

    /// Decodes and transforms the sample at `index`, drawing augmentation
    /// randomness from `rng`.
    pub fn load<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<LeafItem> {
        let sample = self.samples.get(index).ok_or_else(|| {
            Error::Training(format!(
                "sample index {index} out of range for {} samples",
                self.samples.len()
            ))
        })?;

        let image = ImageReader::open(&sample.path)
            .map_err(|e| Error::sample(&sample.path, e))?
            .with_guessed_format()
            .map_err(|e| Error::sample(&sample.path, e))?
            .decode()
            .map_err(|e| Error::sample(&sample.path, e))?;

        Ok(LeafItem {
            image: self.policy.apply(&image, rng),
            label: sample.label,
        })
    }

    /// Like [`load`](Self::load) with a generator seeded from `seed`.
    pub fn try_get(&self, index: usize, seed: u64) -> Result<LeafItem> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.load(index, &mut rng)
    }
}

impl Dataset<LeafItem> for LeafDataset {
    fn get(&self, index: usize) -> Option<LeafItem> {
        match self.try_get(index, index as u64) {
            Ok(item) => Some(item),
            Err(err) => {
                error!("{err}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Batch of images and integer targets
#[derive(Clone, Debug)]
pub struct LeafBatch<B: Backend> {
    /// `[batch, 3, S, S]`
    pub images: Tensor<B, 4>,
    /// `[batch]`
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks [`LeafItem`]s into a [`LeafBatch`]
#[derive(Clone, Debug)]
pub struct LeafBatcher {
    image_size: usize,
}

impl LeafBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, LeafItem, LeafBatch<B>> for LeafBatcher {
    fn batch(&self, items: Vec<LeafItem>, device: &B::Device) -> LeafBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let mut images_data = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_data = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend_from_slice(&item.image);
            targets_data.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images_data, [batch_size, 3, size, size]),
            device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets_data, [batch_size]),
            device,
        );

        LeafBatch { images, targets }
    }
}

/// How the validation set was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSource {
    /// Read from the `val/` partition
    Directory,
    /// Held out from the training partition
    HeldOut,
}

/// Train and validation datasets sharing one class set
#[derive(Debug, Clone)]
pub struct LeafData {
    pub classes: ClassSet,
    pub train: LeafDataset,
    pub val: LeafDataset,
    pub validation_source: ValidationSource,
}

impl LeafData {
    /// Scans `config.root` and builds both datasets.
    ///
    /// Without a `val/` partition the training samples are split with
    /// `config.seed`; the held-out part uses the eval transform.
    pub fn from_config(config: &DatasetConfig) -> Result<Self> {
        let folder = ImageFolder::open(&config.root)?;
        let augmentation = AugmentationConfig::new(config.image_size as u32);
        let train_policy = AugmentationPolicy::train(augmentation.clone());
        let eval_policy = AugmentationPolicy::eval(augmentation);

        info!(
            "Found {} classes: {}",
            folder.classes.len(),
            folder.classes.names().join(", ")
        );

        let (train_samples, val_samples, validation_source) = match folder.val {
            Some(val) => (folder.train, val, ValidationSource::Directory),
            None => {
                info!(
                    "No validation partition, holding out {:.0}% of training samples",
                    config.validation_fraction * 100.0
                );
                let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
                let (train_idx, val_idx) =
                    split_indices(folder.train.len(), config.validation_fraction, &mut rng);
                let pick = |indices: &[usize]| {
                    indices
                        .iter()
                        .map(|&i| folder.train[i].clone())
                        .collect::<Vec<_>>()
                };
                (pick(&train_idx), pick(&val_idx), ValidationSource::HeldOut)
            }
        };

        info!("Training samples: {}", train_samples.len());
        info!("Validation samples: {}", val_samples.len());

        Ok(Self {
            classes: folder.classes,
            train: LeafDataset::new(train_samples, train_policy),
            val: LeafDataset::new(val_samples, eval_policy),
            validation_source,
        })
    }
}
