use std::{path::PathBuf, sync::Arc};

use candle_core::Device;
use east_data::{DetectionDataset, IcdarDataset};
use east_model::{DetectionModel, TextDetector};

use crate::{
    checkpoint::{
        fingerprint_config, should_save, CheckpointDescriptor, CheckpointManager,
        TrainingStateRequest,
    },
    config::ResumeFrom,
    data::{BatchLoader, DetectionBatch, LoaderOptions},
    device::select_devices,
    error::to_compute_error,
    logging::{Logger, LoggingSettings},
    loss::{DetectionLoss, LossComponents},
    metrics::{is_report_batch, BatchProgress, EpochStatistics},
    optimizer::{OptimizerConfig, TrainerOptimizer},
    parallel::maybe_replicate,
    scheduler::{LRScheduler, MultiStepDecay},
    TrainingConfig, TrainingError,
};

/// Where the trainer is in its lifecycle. Epoch payloads are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Initializing,
    Resuming,
    EpochStart(usize),
    BatchLoop(usize),
    EpochEnd(usize),
    Terminated,
}

/// Mutable training state shared by the epoch and batch steps.
pub struct TrainingContext {
    pub device: Device,
    /// Possibly replicated; checkpoints always go through `unwrapped()`.
    pub model: Box<dyn DetectionModel>,
    pub replicated: bool,
    pub optimizer: TrainerOptimizer,
    pub scheduler: Box<dyn LRScheduler>,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub last_epoch_loss: Option<f64>,
    pub checkpoints: Vec<PathBuf>,
    /// Progress records handed to the logger, in order.
    pub reported: Vec<BatchProgress>,
}

pub struct Trainer {
    config: TrainingConfig,
    context: TrainingContext,
    loader: BatchLoader,
    loss: DetectionLoss,
    checkpoints: CheckpointManager,
    logger: Logger,
    phase: TrainerPhase,
    start_epoch: usize,
}

impl Trainer {
    /// Builds a trainer over the ICDAR-style dataset named in the config.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        config.validate_paths()?;
        let dataset = IcdarDataset::open(
            &config.data.train_img_path,
            &config.data.train_gt_path,
            config.data.input_size,
        )?;
        Self::from_parts(config, Arc::new(dataset))
    }

    /// Builds a trainer over any dataset provider.
    pub fn from_parts(
        config: TrainingConfig,
        dataset: Arc<dyn DetectionDataset>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let loader = BatchLoader::new(
            dataset,
            LoaderOptions {
                batch_size: config.data.batch_size,
                num_workers: config.data.num_workers,
                shuffle: config.data.shuffle,
                seed: config.data.seed,
            },
        )?;
        if loader.batches_per_epoch() == 0 {
            return Err(TrainingError::initialization(format!(
                "dataset holds {} samples, fewer than one batch of {}",
                loader.dataset_len(),
                loader.batch_size()
            )));
        }
        log::info!(
            "batch loader ready (samples={} batch_size={} batches_per_epoch={} workers={})",
            loader.dataset_len(),
            loader.batch_size(),
            loader.batches_per_epoch(),
            config.data.num_workers
        );

        let plan = select_devices(
            config.runtime.device,
            config.runtime.data_parallel,
            config.runtime.max_devices,
        )?;
        let detector = TextDetector::new(config.detector_config(), &plan.primary)
            .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;
        let named_parameters = detector.parameters();
        let (model, replicated) = maybe_replicate(Box::new(detector), &plan.replicas);

        let optimizer =
            TrainerOptimizer::new(named_parameters, OptimizerConfig::try_from(&config.optimizer)?)?;

        let checkpoints = CheckpointManager::new(
            &config.checkpoint.directory,
            config.checkpoint.interval,
            config.checkpoint.save_training_state,
        )?;
        let start_epoch = resolve_start_epoch(config.runtime.resume, &checkpoints)?;

        let scheduler = MultiStepDecay::from_config(
            &config.scheduler,
            config.optimizer.learning_rate,
            config.runtime.epoch_iter,
            start_epoch,
        )?;
        log::info!(
            "learning rate {} decays by {} at epochs {:?}",
            config.optimizer.learning_rate,
            config.scheduler.gamma,
            scheduler.milestones()
        );

        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
        let loss = DetectionLoss::new(config.loss.angle_weight);

        Ok(Self {
            context: TrainingContext {
                device: plan.primary,
                model,
                replicated,
                optimizer,
                scheduler: Box::new(scheduler),
            },
            loader,
            loss,
            checkpoints,
            logger,
            phase: TrainerPhase::Initializing,
            start_epoch,
            config,
        })
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    /// First epoch index `train` will run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Loads the checkpoint the run starts from, if any. `train` calls this
    /// when it has not been called yet.
    pub fn resume(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        if self.phase != TrainerPhase::Initializing {
            return Err(TrainingError::runtime(format!(
                "resume is only possible before training starts (phase {:?})",
                self.phase
            )));
        }
        self.phase = TrainerPhase::Resuming;

        if self.start_epoch == 0 {
            log::info!("cold start at epoch 0");
            return Ok(None);
        }

        let descriptor = self
            .checkpoints
            .resume(self.context.model.unwrapped(), self.start_epoch)?;

        if self.config.runtime.restore_optimizer_state {
            self.restore_training_state()?;
        }

        log::info!("resuming at epoch {}", self.start_epoch);
        Ok(Some(descriptor))
    }

    fn restore_training_state(&mut self) -> Result<(), TrainingError> {
        let Some(sidecar) = self.checkpoints.load_training_state(self.start_epoch)? else {
            log::warn!(
                "no training state stored for epoch {}; optimizer starts fresh",
                self.start_epoch
            );
            return Ok(());
        };

        if sidecar.config_sha256 != fingerprint_config(&self.config)? {
            log::warn!("training state was saved under a different configuration");
        }
        self.context.optimizer.load_state(sidecar.optimizer)?;
        self.context.scheduler.restore(&sidecar.scheduler)?;
        self.context
            .optimizer
            .set_learning_rate(self.context.scheduler.learning_rate());
        log::info!(
            "restored optimizer state ({} steps) and learning rate {}",
            self.context.optimizer.steps_taken(),
            self.context.scheduler.learning_rate()
        );
        Ok(())
    }

    /// Runs every epoch from the start epoch up to `runtime.epoch_iter`.
    pub fn train(&mut self) -> Result<TrainingSummary, TrainingError> {
        match self.phase {
            TrainerPhase::Initializing => {
                self.resume()?;
            }
            TrainerPhase::Resuming => {}
            phase => {
                return Err(TrainingError::runtime(format!(
                    "training cannot start from phase {:?}",
                    phase
                )))
            }
        }

        let epoch_iter = self.config.runtime.epoch_iter;
        let mut summary = TrainingSummary {
            start_epoch: self.start_epoch,
            epochs_run: 0,
            last_epoch_loss: None,
            checkpoints: Vec::new(),
            reported: Vec::new(),
        };
        if self.start_epoch >= epoch_iter {
            log::info!(
                "start epoch {} is not below epoch_iter {}; nothing to train",
                self.start_epoch,
                epoch_iter
            );
        }

        for epoch in self.start_epoch..epoch_iter {
            let (mean_loss, saved) = self.run_epoch(epoch, &mut summary.reported)?;
            summary.epochs_run += 1;
            summary.last_epoch_loss = Some(mean_loss);
            summary.checkpoints.extend(saved);
        }

        self.logger.flush();
        self.phase = TrainerPhase::Terminated;
        Ok(summary)
    }

    fn run_epoch(
        &mut self,
        epoch: usize,
        reported: &mut Vec<BatchProgress>,
    ) -> Result<(f64, Option<PathBuf>), TrainingError> {
        self.phase = TrainerPhase::EpochStart(epoch);
        let learning_rate = self.step_schedule(epoch)?;
        let mut stats = EpochStatistics::start(epoch);

        self.phase = TrainerPhase::BatchLoop(epoch);
        let batches = self.loader.batches_per_epoch();
        let log_every = self.config.runtime.log_every_n_batches;
        for (index, batch) in self.loader.epoch(epoch)?.enumerate() {
            let batch = batch?;
            stats.begin_batch();
            let batch = batch.to_device(&self.context.device)?;
            let verbose = is_report_batch(index, log_every);
            let (loss, components) = self.train_batch(&batch, verbose, epoch, index)?;
            let elapsed = stats.record(loss);
            if verbose {
                let progress = BatchProgress {
                    epoch,
                    epoch_iter: self.config.runtime.epoch_iter,
                    batch: index,
                    batches,
                    elapsed,
                    loss,
                    components,
                };
                self.logger.log_batch(&progress);
                reported.push(progress);
            }
        }

        self.phase = TrainerPhase::EpochEnd(epoch);
        let summary = stats.finish(learning_rate);
        self.logger.log_epoch(&summary);

        let saved = if should_save(epoch, self.checkpoints.interval()) {
            let state = if self.checkpoints.saves_training_state() {
                Some(TrainingStateRequest {
                    config: &self.config,
                    optimizer: self.context.optimizer.state()?,
                    scheduler: self.context.scheduler.snapshot(),
                })
            } else {
                None
            };
            let descriptor = self
                .checkpoints
                .save(self.context.model.unwrapped(), epoch, state)?;
            Some(descriptor.weights_path)
        } else {
            None
        };

        Ok((summary.mean_loss, saved))
    }

    /// Advances the schedule exactly once for `epoch`.
    fn step_schedule(&mut self, epoch: usize) -> Result<f64, TrainingError> {
        let expected = self.context.scheduler.next_epoch();
        if expected != epoch {
            return Err(TrainingError::runtime(format!(
                "scheduler expects epoch {expected} but epoch {epoch} is starting"
            )));
        }
        let learning_rate = self.context.scheduler.step();
        self.context.optimizer.set_learning_rate(learning_rate);
        Ok(learning_rate)
    }

    fn train_batch(
        &mut self,
        batch: &DetectionBatch,
        verbose: bool,
        epoch: usize,
        index: usize,
    ) -> Result<(f64, Option<LossComponents>), TrainingError> {
        let (pred_score, pred_geo) = self
            .context
            .model
            .forward(&batch.images)
            .map_err(to_compute_error)?;
        let output = self.loss.compute(
            &batch.score_maps,
            &pred_score,
            &batch.geometry_maps,
            &pred_geo,
            &batch.ignore_masks,
            verbose,
        )?;

        let value = f64::from(output.loss.to_scalar::<f32>().map_err(to_compute_error)?);
        if !value.is_finite() {
            return Err(TrainingError::compute(format!(
                "loss became {value} at epoch {} batch {}",
                epoch + 1,
                index + 1
            )));
        }

        self.context.optimizer.apply_gradients(&output.loss)?;
        Ok((value, output.components))
    }
}

fn resolve_start_epoch(
    resume: Option<ResumeFrom>,
    checkpoints: &CheckpointManager,
) -> Result<usize, TrainingError> {
    match resume {
        None => Ok(0),
        Some(ResumeFrom::Epoch(epoch)) => Ok(epoch),
        Some(ResumeFrom::Latest) => {
            let latest = checkpoints.latest_epoch()?;
            match latest {
                Some(epoch) => log::info!(
                    "latest checkpoint in {} is epoch {}",
                    checkpoints.directory().display(),
                    epoch
                ),
                None => log::info!(
                    "no checkpoints in {}",
                    checkpoints.directory().display()
                ),
            }
            Ok(latest.unwrap_or(0))
        }
    }
}
