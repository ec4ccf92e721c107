use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

/// Per-epoch learning-rate schedule.
///
/// `step` is called once at the start of every epoch and returns the rate
/// that epoch trains with.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// Epoch index the next `step` call applies to.
    fn next_epoch(&self) -> usize;
    fn snapshot(&self) -> SchedulerState;
    fn restore(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: String,
    pub base_lr: f64,
    pub gamma: f64,
    pub milestones: Vec<usize>,
    pub next_epoch: usize,
    pub current_lr: f64,
}

const MULTI_STEP: &str = "multi_step";

/// Multiplies the learning rate by `gamma` at each milestone epoch.
#[derive(Debug, Clone)]
pub struct MultiStepDecay {
    base_lr: f64,
    gamma: f64,
    milestones: Vec<usize>,
    next_epoch: usize,
    current_lr: f64,
}

impl MultiStepDecay {
    pub fn new(
        base_lr: f64,
        mut milestones: Vec<usize>,
        gamma: f64,
        start_epoch: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 || !base_lr.is_finite() {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if gamma <= 0.0 || !gamma.is_finite() {
            return Err(TrainingError::initialization(
                "scheduler gamma must be positive",
            ));
        }
        milestones.sort_unstable();
        milestones.dedup();

        let mut scheduler = Self {
            base_lr,
            gamma,
            milestones,
            next_epoch: start_epoch,
            current_lr: base_lr,
        };
        // Fast-forward so a resumed run sees the rate the last finished epoch used.
        if let Some(previous) = start_epoch.checked_sub(1) {
            scheduler.current_lr = scheduler.learning_rate_at(previous);
        }
        Ok(scheduler)
    }

    pub fn from_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        epoch_iter: usize,
        start_epoch: usize,
    ) -> Result<Self, TrainingError> {
        Self::new(
            base_lr,
            cfg.resolved_milestones(epoch_iter),
            cfg.gamma,
            start_epoch,
        )
    }

    /// Closed form: `base_lr * gamma^(milestones <= epoch)`.
    pub fn learning_rate_at(&self, epoch: usize) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    pub fn milestones(&self) -> &[usize] {
        &self.milestones
    }
}

impl LRScheduler for MultiStepDecay {
    fn step(&mut self) -> f64 {
        let epoch = self.next_epoch;
        if self.milestones.binary_search(&epoch).is_ok() {
            self.current_lr *= self.gamma;
        }
        self.next_epoch = self.next_epoch.saturating_add(1);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn next_epoch(&self) -> usize {
        self.next_epoch
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: MULTI_STEP.to_string(),
            base_lr: self.base_lr,
            gamma: self.gamma,
            milestones: self.milestones.clone(),
            next_epoch: self.next_epoch,
            current_lr: self.current_lr,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.kind != MULTI_STEP {
            return Err(TrainingError::runtime(format!(
                "scheduler state of kind '{}' cannot be restored into '{}'",
                state.kind, MULTI_STEP
            )));
        }
        if state.milestones != self.milestones || state.gamma != self.gamma {
            log::warn!(
                "restored scheduler position was saved with milestones {:?} gamma {}; continuing with milestones {:?} gamma {}",
                state.milestones,
                state.gamma,
                self.milestones,
                self.gamma
            );
        }
        self.next_epoch = state.next_epoch;
        self.current_lr = state.current_lr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(scheduler: &mut MultiStepDecay, epochs: usize) -> Vec<f64> {
        (0..epochs).map(|_| scheduler.step()).collect()
    }

    #[test]
    fn decays_once_at_the_default_midpoint() {
        let cfg = config::SchedulerConfig::default();
        let mut scheduler = MultiStepDecay::from_config(&cfg, 1e-3, 600, 0).unwrap();
        let rates = rates(&mut scheduler, 600);
        assert_eq!(rates[0], 1e-3);
        assert_eq!(rates[299], 1e-3);
        assert!((rates[300] - 1e-4).abs() < 1e-12);
        assert!((rates[599] - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn stepping_matches_closed_form() {
        let mut scheduler = MultiStepDecay::new(1.0, vec![6, 2, 2, 4], 0.5, 0).unwrap();
        assert_eq!(scheduler.milestones(), &[2, 4, 6]);
        for epoch in 0..10 {
            let lr = scheduler.step();
            assert!((lr - scheduler.learning_rate_at(epoch)).abs() < 1e-12);
        }
    }

    #[test]
    fn starting_late_fast_forwards_past_milestones() {
        let mut resumed = MultiStepDecay::new(1e-3, vec![5], 0.1, 7).unwrap();
        assert!((resumed.learning_rate() - 1e-4).abs() < 1e-12);
        assert_eq!(resumed.next_epoch(), 7);
        assert!((resumed.step() - 1e-4).abs() < 1e-12);

        let mut at_milestone = MultiStepDecay::new(1e-3, vec![5], 0.1, 5).unwrap();
        assert_eq!(at_milestone.learning_rate(), 1e-3);
        assert!((at_milestone.step() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn snapshot_restores_position() {
        let mut original = MultiStepDecay::new(1.0, vec![1], 0.1, 0).unwrap();
        original.step();
        original.step();
        let snapshot = original.snapshot();

        let mut fresh = MultiStepDecay::new(1.0, vec![1], 0.1, 0).unwrap();
        fresh.restore(&snapshot).unwrap();
        assert_eq!(fresh.next_epoch(), 2);
        assert_eq!(fresh.step(), original.step());
    }

    #[test]
    fn foreign_state_is_rejected() {
        let mut scheduler = MultiStepDecay::new(1.0, vec![1], 0.1, 0).unwrap();
        let mut state = scheduler.snapshot();
        state.kind = "cosine".into();
        assert!(scheduler.restore(&state).is_err());
    }

    #[test]
    fn rejects_non_positive_rates() {
        assert!(MultiStepDecay::new(0.0, vec![], 0.1, 0).is_err());
        assert!(MultiStepDecay::new(1.0, vec![], 0.0, 0).is_err());
    }
}
