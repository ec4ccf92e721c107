//! Training driver for the EAST text detector: batch loading, device
//! selection and replication, the detection loss, Adam-family optimisation
//! with a multi-step schedule, and epoch checkpoints.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod parallel;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManager};
pub use config::{ResumeFrom, TrainingConfig};
pub use data::{BatchLoader, DetectionBatch, HostBatch, LoaderOptions};
pub use device::{select_devices, DevicePlan, DevicePreference};
pub use error::TrainingError;
pub use logging::{Logger, LoggingSettings};
pub use loss::{DetectionLoss, LossComponents, LossOutput};
pub use optimizer::{OptimizerConfig, OptimizerState, TrainerOptimizer};
pub use parallel::{maybe_replicate, ReplicatedModel};
pub use scheduler::{LRScheduler, MultiStepDecay, SchedulerState};
pub use trainer::{Trainer, TrainerPhase, TrainingContext, TrainingSummary};
