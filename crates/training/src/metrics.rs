use std::time::{Duration, Instant};

use crate::loss::LossComponents;

/// Running loss totals for the epoch in progress.
#[derive(Debug)]
pub struct EpochStatistics {
    epoch: usize,
    summed_loss: f64,
    batch_count: usize,
    started: Instant,
    batch_started: Instant,
}

impl EpochStatistics {
    pub fn start(epoch: usize) -> Self {
        let now = Instant::now();
        Self {
            epoch,
            summed_loss: 0.0,
            batch_count: 0,
            started: now,
            batch_started: now,
        }
    }

    pub fn begin_batch(&mut self) {
        self.batch_started = Instant::now();
    }

    /// Adds one batch loss and returns the time spent on that batch.
    pub fn record(&mut self, batch_loss: f64) -> Duration {
        self.summed_loss += batch_loss;
        self.batch_count += 1;
        self.batch_started.elapsed()
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn mean_loss(&self) -> f64 {
        if self.batch_count == 0 {
            0.0
        } else {
            self.summed_loss / self.batch_count as f64
        }
    }

    pub fn finish(self, learning_rate: f64) -> EpochSummary {
        EpochSummary {
            epoch: self.epoch,
            mean_loss: self.mean_loss(),
            batch_count: self.batch_count,
            elapsed: self.started.elapsed(),
            learning_rate,
        }
    }
}

/// Whether batch `index` of an epoch gets loss components and a progress
/// line. Batch 0 always does.
pub fn is_report_batch(index: usize, log_every_n_batches: usize) -> bool {
    index % log_every_n_batches.max(1) == 0
}

/// Emitted once per batch that hits the logging cadence.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub epoch: usize,
    pub epoch_iter: usize,
    pub batch: usize,
    pub batches: usize,
    pub elapsed: Duration,
    pub loss: f64,
    pub components: Option<LossComponents>,
}

impl BatchProgress {
    /// Global step for scalar summaries.
    pub fn global_step(&self) -> usize {
        self.epoch * self.batches + self.batch
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub mean_loss: f64,
    pub batch_count: usize,
    pub elapsed: Duration,
    pub learning_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_is_sum_over_batches() {
        let mut stats = EpochStatistics::start(3);
        for loss in [1.0, 2.0, 6.0] {
            stats.begin_batch();
            stats.record(loss);
        }
        let summary = stats.finish(0.1);
        assert_eq!(summary.epoch, 3);
        assert_eq!(summary.batch_count, 3);
        assert!((summary.mean_loss - 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_epoch_reports_zero() {
        assert_eq!(EpochStatistics::start(0).mean_loss(), 0.0);
    }

    #[test]
    fn reports_every_nth_batch_starting_at_zero() {
        let reported: Vec<usize> = (0..25).filter(|&i| is_report_batch(i, 10)).collect();
        assert_eq!(reported, [0, 10, 20]);
        assert!((0..4).all(|i| is_report_batch(i, 1)));
        assert!(is_report_batch(0, 0));
    }

    #[test]
    fn global_step_counts_batches_across_epochs() {
        let progress = BatchProgress {
            epoch: 2,
            epoch_iter: 10,
            batch: 3,
            batches: 5,
            elapsed: Duration::ZERO,
            loss: 0.0,
            components: None,
        };
        assert_eq!(progress.global_step(), 13);
    }
}
