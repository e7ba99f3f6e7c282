use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Tensor},
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::N_BITS;
use crate::data::{RockDataset, RockSample};
use crate::engine::DataSource;

/// Quantise a `[0, 1]` value to `n_bits` and center it around zero.
pub fn preprocess_value(x: f32, n_bits: u32) -> f32 {
    let n_bins = (1u32 << n_bits) as f32;
    let step = (1u32 << (8 - n_bits)) as f32;
    ((x * 255.0).round() / step).floor() / n_bins - 0.5
}

/// Map model-space images back to bytes (CHW order preserved).
pub fn postprocess<B: Backend, const D: usize>(x: Tensor<B, D>, n_bits: u32) -> Result<Vec<u8>> {
    let scale = (1u32 << n_bits) as f64;
    let values = x
        .clamp(-0.5, 0.5)
        .add_scalar(0.5)
        .mul_scalar(scale)
        .clamp(0.0, 255.0)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read sampled images: {:?}", e))?;
    Ok(values.into_iter().map(|v| v as u8).collect())
}

/// One batch of rock patches
#[derive(Debug, Clone)]
pub struct RockBatch<B: Backend> {
    /// `[batch, channels, height, width]`, preprocessed
    pub images: Tensor<B, 4>,
    /// One-hot class targets `[batch, num_classes]`
    pub targets: Tensor<B, 2>,
    pub labels: Vec<usize>,
}

impl<B: Backend> RockBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Clone, Debug)]
pub struct RockBatcher<B: Backend> {
    device: B::Device,
    image_shape: (usize, usize, usize),
    num_classes: usize,
}

impl<B: Backend> RockBatcher<B> {
    /// `image_shape` is `(height, width, channels)`.
    pub fn new(device: B::Device, image_shape: (usize, usize, usize), num_classes: usize) -> Self {
        Self {
            device,
            image_shape,
            num_classes,
        }
    }
}

impl<B: Backend> Batcher<RockSample, RockBatch<B>> for RockBatcher<B> {
    fn batch(&self, items: Vec<RockSample>) -> RockBatch<B> {
        let (h, w, c) = self.image_shape;
        let batch_size = items.len();

        let mut pixels = Vec::with_capacity(batch_size * c * h * w);
        let mut onehot = vec![0.0f32; batch_size * self.num_classes];
        let mut labels = Vec::with_capacity(batch_size);

        for (i, sample) in items.iter().enumerate() {
            pixels.extend(sample.pixels.iter().map(|&x| preprocess_value(x, N_BITS)));
            if sample.label < self.num_classes {
                onehot[i * self.num_classes + sample.label] = 1.0;
            }
            labels.push(sample.label);
        }

        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([batch_size, c, h, w]);
        let targets = Tensor::<B, 1>::from_floats(onehot.as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);

        RockBatch {
            images,
            targets,
            labels,
        }
    }
}

/// Batched view of a split the engine can iterate once per epoch.
///
/// Batches are cut from one index order over the whole split (reshuffled
/// every pass for training), so only the final short batch can be dropped.
/// Samples of a batch are decoded on a rayon pool of `num_workers` threads,
/// or on the calling thread when `num_workers` is 0.
#[derive(Clone)]
pub struct Loader<B: Backend> {
    batcher: RockBatcher<B>,
    dataset: Arc<RockDataset>,
    batch_size: usize,
    shuffle: Option<u64>,
    drop_last: bool,
    pool: Option<Arc<ThreadPool>>,
    passes: Arc<AtomicU64>,
}

impl<B: Backend> Loader<B> {
    /// Shuffled loader that skips the final short batch.
    pub fn train(
        batcher: RockBatcher<B>,
        dataset: RockDataset,
        batch_size: usize,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self> {
        Self::build(batcher, dataset, batch_size, num_workers, Some(seed), true)
    }

    /// In-order loader keeping every sample.
    pub fn eval(
        batcher: RockBatcher<B>,
        dataset: RockDataset,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        Self::build(batcher, dataset, batch_size, num_workers, None, false)
    }

    fn build(
        batcher: RockBatcher<B>,
        dataset: RockDataset,
        batch_size: usize,
        num_workers: usize,
        shuffle: Option<u64>,
        drop_last: bool,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        let pool = match num_workers {
            0 => None,
            n => Some(Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("rock-loader-{i}"))
                    .build()
                    .context("Failed to start data loading workers")?,
            )),
        };
        Ok(Self {
            batcher,
            dataset: Arc::new(dataset),
            batch_size,
            shuffle,
            drop_last,
            pool,
            passes: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn num_items(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sample order for the next pass.
    fn order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle {
            let pass = self.passes.fetch_add(1, Ordering::Relaxed);
            order.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(pass)));
        }
        order
    }

    fn load_batch(&self, indices: &[usize]) -> Result<RockBatch<B>> {
        let dataset = &self.dataset;
        let items = match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| dataset.get(i))
                    .collect::<Result<Vec<_>>>()
            })?,
            None => indices
                .iter()
                .map(|&i| dataset.get(i))
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(self.batcher.batch(items))
    }
}

impl<B: Backend> DataSource<RockBatch<B>> for Loader<B> {
    fn len(&self) -> usize {
        if self.drop_last {
            self.num_items() / self.batch_size
        } else {
            self.num_items().div_ceil(self.batch_size)
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Result<RockBatch<B>>> + '_> {
        let batches: Vec<Vec<usize>> = self
            .order()
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        Box::new(batches.into_iter().map(move |indices| self.load_batch(&indices)))
    }
}
