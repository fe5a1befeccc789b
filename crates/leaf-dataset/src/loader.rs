//! Prefetching batch loader.
//!
//! A producer thread walks the epoch's index order in batch-sized chunks. Each
//! chunk is decoded and augmented on a dedicated rayon pool, stacked into a
//! batch and pushed into a bounded channel, so at most `prefetch` finished
//! batches wait ahead of the training loop. Batches come out in exactly the
//! epoch's index order.

use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use leaf_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::dataset::{LeafBatch, LeafBatcher, LeafDataset};

/// Loader settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub prefetch: usize,
    /// Reshuffle every epoch; `None` keeps insertion order
    pub shuffle_seed: Option<u64>,
}

/// Iterates a [`LeafDataset`] as device batches
pub struct BatchLoader<B: Backend> {
    dataset: Arc<LeafDataset>,
    batcher: LeafBatcher,
    config: LoaderConfig,
    pool: Arc<ThreadPool>,
    device: B::Device,
}

impl<B: Backend> BatchLoader<B> {
    pub fn new(dataset: LeafDataset, config: LoaderConfig, device: B::Device) -> Result<Self> {
        if config.batch_size == 0 || config.num_workers == 0 || config.prefetch == 0 {
            return Err(Error::Config(
                "batch_size, num_workers and prefetch must be positive".into(),
            ));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .thread_name(|i| format!("leaf-loader-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build loader pool: {e}")))?;
        let batcher = LeafBatcher::new(dataset.policy().image_size());

        Ok(Self {
            dataset: Arc::new(dataset),
            batcher,
            config,
            pool: Arc::new(pool),
            device,
        })
    }

    pub fn dataset(&self) -> &LeafDataset {
        &self.dataset
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size)
    }

    /// Sample order for `epoch`
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.config.shuffle_seed {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Starts producing the batches of `epoch`.
    pub fn iter(&self, epoch: usize) -> BatchIter<B> {
        let order = self.epoch_order(epoch);
        let (sender, receiver) = sync_channel(self.config.prefetch);

        let dataset = Arc::clone(&self.dataset);
        let pool = Arc::clone(&self.pool);
        let batcher = self.batcher.clone();
        let device = self.device.clone();
        let batch_size = self.config.batch_size;
        let base_seed = self
            .config
            .shuffle_seed
            .unwrap_or(0)
            .wrapping_add((epoch as u64) << 32);

        thread::spawn(move || {
            for (batch_idx, chunk) in order.chunks(batch_size).enumerate() {
                let items = pool.install(|| {
                    chunk
                        .par_iter()
                        .map(|&index| dataset.try_get(index, sample_seed(base_seed, index)))
                        .collect::<Result<Vec<_>>>()
                });

                let message = items.map(|items| {
                    <LeafBatcher as Batcher<B, _, LeafBatch<B>>>::batch(&batcher, items, &device)
                });
                let failed = message.is_err();
                if sender.send(message).is_err() {
                    debug!("Batch consumer dropped after {batch_idx} batches");
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        BatchIter { receiver }
    }
}

fn sample_seed(base: u64, index: usize) -> u64 {
    base ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Batches of one epoch. Yields `Err` once and stops if a sample fails to load.
pub struct BatchIter<B: Backend> {
    receiver: Receiver<Result<LeafBatch<B>>>,
}

impl<B: Backend> Iterator for BatchIter<B> {
    type Item = Result<LeafBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}
