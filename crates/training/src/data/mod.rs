use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};
use east_data::{DataError, DetectionDataset, MapBuffer, Sample};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

use crate::{error::to_compute_error, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// Threads preparing samples. Zero prepares batches on the caller's thread.
    pub num_workers: usize,
    pub shuffle: bool,
    /// Fixed seed makes the permutation of epoch `e` depend only on `seed + e`.
    pub seed: Option<u64>,
}

/// Host-side stack of equally shaped maps, `[batch, channels, height, width]`.
#[derive(Debug, Clone)]
pub struct StackedMaps {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

impl StackedMaps {
    fn stack<'a>(label: &str, buffers: impl ExactSizeIterator<Item = &'a MapBuffer>) -> std::result::Result<Self, DataError> {
        let count = buffers.len();
        let mut data = Vec::new();
        let mut shape: Option<[usize; 3]> = None;
        for buffer in buffers {
            match shape {
                None => {
                    shape = Some(buffer.shape);
                    data.reserve(buffer.data.len() * count);
                }
                Some(expected) if expected != buffer.shape => {
                    return Err(DataError::Shape(format!(
                        "{label} shapes differ within a batch: {:?} vs {:?}",
                        expected, buffer.shape
                    )));
                }
                Some(_) => {}
            }
            data.extend_from_slice(&buffer.data);
        }
        let [c, h, w] = shape.unwrap_or([0, 0, 0]);
        Ok(Self {
            data,
            shape: [count, c, h, w],
        })
    }

    fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let [b, c, h, w] = self.shape;
        Tensor::from_slice(&self.data, (b, c, h, w), device)
    }
}

/// Collated batch waiting to be moved to a device.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub indices: Vec<usize>,
    pub images: StackedMaps,
    pub score_maps: StackedMaps,
    pub geometry_maps: StackedMaps,
    pub ignore_masks: StackedMaps,
}

impl HostBatch {
    pub fn collate(indices: Vec<usize>, samples: &[Sample]) -> std::result::Result<Self, DataError> {
        Ok(Self {
            images: StackedMaps::stack("image", samples.iter().map(|s| &s.image))?,
            score_maps: StackedMaps::stack("score_map", samples.iter().map(|s| &s.score_map))?,
            geometry_maps: StackedMaps::stack(
                "geometry_map",
                samples.iter().map(|s| &s.geometry_map),
            )?,
            ignore_masks: StackedMaps::stack(
                "ignore_mask",
                samples.iter().map(|s| &s.ignore_mask),
            )?,
            indices,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn to_device(&self, device: &Device) -> Result<DetectionBatch> {
        Ok(DetectionBatch {
            images: self.images.to_tensor(device).map_err(to_compute_error)?,
            score_maps: self.score_maps.to_tensor(device).map_err(to_compute_error)?,
            geometry_maps: self.geometry_maps.to_tensor(device).map_err(to_compute_error)?,
            ignore_masks: self.ignore_masks.to_tensor(device).map_err(to_compute_error)?,
            indices: self.indices.clone(),
        })
    }
}

/// Batch materialised on the training device.
#[derive(Debug)]
pub struct DetectionBatch {
    pub images: Tensor,
    pub score_maps: Tensor,
    pub geometry_maps: Tensor,
    pub ignore_masks: Tensor,
    pub indices: Vec<usize>,
}

/// Shuffling, fixed-size batch loader that drops the incomplete tail batch.
pub struct BatchLoader {
    dataset: Arc<dyn DetectionDataset>,
    options: LoaderOptions,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl BatchLoader {
    pub fn new(dataset: Arc<dyn DetectionDataset>, options: LoaderOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }

        let pool = if options.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.num_workers)
                .thread_name(|index| format!("batch-worker-{index}"))
                .build()
                .map_err(|err| {
                    TrainingError::initialization(format!("failed to start data workers: {err}"))
                })?;
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Self {
            dataset,
            options,
            pool,
        })
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    /// `floor(N / B)`.
    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len() / self.options.batch_size
    }

    /// Permutation of the dataset indices used for `epoch`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = match self.options.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
                None => StdRng::from_entropy(),
            };
            order.shuffle(&mut rng);
        }
        order
    }

    /// Starts one traversal. Only complete batches are produced.
    pub fn epoch(&self, epoch: usize) -> Result<EpochBatches> {
        let batch_size = self.options.batch_size;
        let groups: Vec<Vec<usize>> = self
            .epoch_order(epoch)
            .chunks_exact(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let remaining = groups.len();

        let source = match &self.pool {
            None => EpochSource::Inline {
                dataset: Arc::clone(&self.dataset),
                groups: groups.into_iter(),
            },
            Some(pool) => {
                let (sender, receiver) = mpsc::sync_channel(2 * self.options.num_workers);
                let dataset = Arc::clone(&self.dataset);
                let pool = Arc::clone(pool);
                let worker = thread::Builder::new()
                    .name(format!("batch-prefetch-{epoch}"))
                    .spawn(move || {
                        for group in groups {
                            let batch = pool.install(|| prepare_parallel(dataset.as_ref(), group));
                            let failed = batch.is_err();
                            if sender.send(batch).is_err() || failed {
                                break;
                            }
                        }
                    })
                    .map_err(|err| {
                        TrainingError::runtime(format!("failed to start prefetch thread: {err}"))
                    })?;
                EpochSource::Prefetch {
                    receiver: Some(receiver),
                    worker: Some(worker),
                }
            }
        };

        Ok(EpochBatches { source, remaining })
    }
}

fn prepare_sequential(
    dataset: &dyn DetectionDataset,
    indices: Vec<usize>,
) -> std::result::Result<HostBatch, DataError> {
    let samples = indices
        .iter()
        .map(|&index| dataset.get(index))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    HostBatch::collate(indices, &samples)
}

fn prepare_parallel(
    dataset: &dyn DetectionDataset,
    indices: Vec<usize>,
) -> std::result::Result<HostBatch, DataError> {
    // Indexed parallel collect keeps the permutation order.
    let samples = indices
        .par_iter()
        .map(|&index| dataset.get(index))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    HostBatch::collate(indices, &samples)
}

enum EpochSource {
    Inline {
        dataset: Arc<dyn DetectionDataset>,
        groups: std::vec::IntoIter<Vec<usize>>,
    },
    Prefetch {
        receiver: Option<Receiver<std::result::Result<HostBatch, DataError>>>,
        worker: Option<JoinHandle<()>>,
    },
}

/// Finite iterator over the batches of one epoch.
pub struct EpochBatches {
    source: EpochSource,
    remaining: usize,
}

impl Iterator for EpochBatches {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = match &mut self.source {
            EpochSource::Inline { dataset, groups } => {
                let group = groups.next()?;
                prepare_sequential(dataset.as_ref(), group).map_err(TrainingError::from)
            }
            EpochSource::Prefetch { receiver, .. } => match receiver.as_ref()?.recv() {
                Ok(batch) => batch.map_err(TrainingError::from),
                Err(_) => Err(TrainingError::runtime(
                    "batch prefetch thread stopped before the epoch finished",
                )),
            },
        };
        self.remaining = if item.is_ok() { self.remaining - 1 } else { 0 };
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for EpochBatches {}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let EpochSource::Prefetch { receiver, worker } = &mut self.source {
            // Closing the channel unblocks a producer waiting on a full queue.
            drop(receiver.take());
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}
