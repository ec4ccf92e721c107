use std::{
    fs,
    path::{Path, PathBuf},
};

use east_model::TextDetectorConfig;
use serde::{Deserialize, Serialize};

use crate::{device::DevicePreference, TrainingError};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelOverrides,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.train_img_path.as_os_str().is_empty() {
            errors.push("data.train_img_path must not be empty".to_string());
        }

        if self.data.train_gt_path.as_os_str().is_empty() {
            errors.push("data.train_gt_path must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.input_size == 0 || self.data.input_size % east_model::OUTPUT_STRIDE != 0 {
            errors.push(format!(
                "data.input_size must be a positive multiple of {}",
                east_model::OUTPUT_STRIDE
            ));
        }

        if let Some(0) = self.model.base_channels {
            errors.push("model.base_channels must be greater than 0".to_string());
        }

        if let Some(scope) = self.model.geometry_scope {
            if !(scope.is_finite() && scope > 0.0) {
                errors.push("model.geometry_scope must be greater than 0".to_string());
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if !(0.0 < self.scheduler.gamma && self.scheduler.gamma <= 1.0) {
            errors.push("scheduler.gamma must be in (0, 1]".to_string());
        }

        if self.loss.angle_weight < 0.0 {
            errors.push("loss.angle_weight must be >= 0".to_string());
        }

        if self.checkpoint.directory.as_os_str().is_empty() {
            errors.push("checkpoint.directory must not be empty".to_string());
        }

        if self.checkpoint.interval == 0 {
            errors.push("checkpoint.interval must be greater than 0".to_string());
        }

        if self.runtime.epoch_iter == 0 {
            errors.push("runtime.epoch_iter must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_batches == 0 {
            errors.push("runtime.log_every_n_batches must be greater than 0".to_string());
        }

        if let Some(0) = self.runtime.max_devices {
            errors.push("runtime.max_devices must be greater than 0".to_string());
        }

        if let Some(ResumeFrom::Epoch(epoch)) = self.runtime.resume {
            if epoch == 0 {
                errors.push(
                    "runtime.resume epoch must be at least 1; omit runtime.resume (or pass --cold-start) to start at epoch 0"
                        .to_string(),
                );
            } else if epoch > self.runtime.epoch_iter {
                errors.push(format!(
                    "runtime.resume epoch {} exceeds runtime.epoch_iter {}",
                    epoch, self.runtime.epoch_iter
                ));
            }
        }

        if self.runtime.logging.tensorboard_flush_every_n == 0 {
            errors.push(
                "runtime.logging.tensorboard_flush_every_n must be greater than 0".to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Checks that the dataset directories exist. Run before building the
    /// filesystem-backed dataset.
    pub fn validate_paths(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        for (label, path) in [
            ("data.train_img_path", &self.data.train_img_path),
            ("data.train_gt_path", &self.data.train_gt_path),
        ] {
            if !path.is_dir() {
                errors.push(format!("{} ({}) is not a directory", label, path.display()));
            }
        }
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }

    pub fn detector_config(&self) -> TextDetectorConfig {
        let defaults = TextDetectorConfig::default();
        TextDetectorConfig {
            input_channels: defaults.input_channels,
            base_channels: self.model.base_channels.unwrap_or(defaults.base_channels),
            geometry_scope: self.model.geometry_scope.unwrap_or(defaults.geometry_scope),
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.checkpoint.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub base_channels: Option<usize>,
    #[serde(default)]
    pub geometry_scope: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    pub train_img_path: PathBuf,
    pub train_gt_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_img_path, base);
        absolutize_in_place(&mut self.train_gt_path, base);
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Adam,
    #[serde(rename = "adamw")]
    AdamW,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Epoch indices at which the learning rate is multiplied by `gamma`.
    /// Defaults to `[epoch_iter / 2]`.
    #[serde(default)]
    pub milestones: Option<Vec<usize>>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            milestones: None,
            gamma: default_gamma(),
        }
    }
}

impl SchedulerConfig {
    pub fn resolved_milestones(&self, epoch_iter: usize) -> Vec<usize> {
        self.milestones
            .clone()
            .unwrap_or_else(|| vec![epoch_iter / 2])
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LossConfig {
    #[serde(default = "default_angle_weight")]
    pub angle_weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            angle_weight: default_angle_weight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    /// Save after every `interval`-th completed epoch.
    #[serde(default = "default_checkpoint_interval")]
    pub interval: usize,
    /// Write optimizer and scheduler state next to the weights.
    #[serde(default)]
    pub save_training_state: bool,
}

impl CheckpointConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.directory, base);
    }
}

/// Where a run starts. Absent means a cold start at epoch 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFrom {
    /// Load `model_epoch_{N}.pth` and continue at epoch index `N`.
    Epoch(usize),
    /// Resume from the highest-numbered checkpoint, cold start if there is none.
    Latest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epoch_iter")]
    pub epoch_iter: usize,
    #[serde(default = "default_log_every_n_batches")]
    pub log_every_n_batches: usize,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default = "default_true")]
    pub data_parallel: bool,
    #[serde(default)]
    pub max_devices: Option<usize>,
    #[serde(default)]
    pub resume: Option<ResumeFrom>,
    #[serde(default)]
    pub restore_optimizer_state: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epoch_iter: default_epoch_iter(),
            log_every_n_batches: default_log_every_n_batches(),
            device: DevicePreference::default(),
            data_parallel: true,
            max_devices: None,
            resume: None,
            restore_optimizer_state: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && !path.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    8
}

fn default_num_workers() -> usize {
    4
}

fn default_input_size() -> usize {
    512
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_gamma() -> f64 {
    0.1
}

fn default_angle_weight() -> f64 {
    10.0
}

fn default_checkpoint_interval() -> usize {
    5
}

fn default_epoch_iter() -> usize {
    600
}

fn default_log_every_n_batches() -> usize {
    10
}

fn default_tensorboard_flush() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[data]
train_img_path = "images"
train_gt_path = "gt"

[checkpoint]
directory = "pths"
"#;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.data.batch_size, 8);
        assert_eq!(config.data.num_workers, 4);
        assert_eq!(config.optimizer.learning_rate, 1e-3);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Adam);
        assert_eq!(config.runtime.epoch_iter, 600);
        assert_eq!(config.runtime.log_every_n_batches, 10);
        assert_eq!(config.checkpoint.interval, 5);
        assert_eq!(config.scheduler.resolved_milestones(600), vec![300]);
        assert_eq!(config.runtime.resume, None);
        assert!(!config.runtime.restore_optimizer_state);
    }

    #[test]
    fn resume_accepts_epoch_and_latest() {
        let epoch: TrainingConfig =
            toml::from_str(&format!("{MINIMAL}\n[runtime]\nresume = {{ epoch = 195 }}\n")).unwrap();
        assert_eq!(epoch.runtime.resume, Some(ResumeFrom::Epoch(195)));

        let latest: TrainingConfig =
            toml::from_str(&format!("{MINIMAL}\n[runtime]\nresume = \"latest\"\n")).unwrap();
        assert_eq!(latest.runtime.resume, Some(ResumeFrom::Latest));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.batch_size = 0;
        config.data.train_img_path = PathBuf::new();
        config.checkpoint.interval = 0;
        config.runtime.resume = Some(ResumeFrom::Epoch(601));

        match config.validate() {
            Err(TrainingError::Validation(errors)) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("batch_size")));
                assert!(errors.iter().any(|e| e.contains("train_img_path")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn resume_from_epoch_zero_is_rejected() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.runtime.resume = Some(ResumeFrom::Epoch(0));
        match config.validate() {
            Err(TrainingError::Validation(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("--cold-start"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        config.runtime.resume = Some(ResumeFrom::Epoch(1));
        config.validate().unwrap();
    }

    #[test]
    fn relative_paths_resolve_against_config_directory() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.apply_base_path(Path::new("/runs/east"));
        assert_eq!(config.data.train_img_path, PathBuf::from("/runs/east/images"));
        assert_eq!(config.checkpoint.directory, PathBuf::from("/runs/east/pths"));
    }

    #[test]
    fn missing_dataset_directories_fail_path_validation() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        assert!(matches!(
            config.validate_paths(),
            Err(TrainingError::Validation(errors)) if errors.len() == 2
        ));
    }

    #[test]
    fn json_round_trip_preserves_settings() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.runtime.resume = Some(ResumeFrom::Latest);
        config.optimizer.algorithm = OptimizerType::AdamW;
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.runtime.resume, Some(ResumeFrom::Latest));
        assert_eq!(back.optimizer.algorithm, OptimizerType::AdamW);
    }
}
