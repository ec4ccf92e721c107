use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor};
use east_model::{DetectionModel, LoadError};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    optimizer::OptimizerState, scheduler::SchedulerState, TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const WEIGHTS_PREFIX: &str = "model_epoch_";
const WEIGHTS_SUFFIX: &str = ".pth";
const STATE_SUFFIX: &str = ".state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Optimizer and scheduler state written next to a weights file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStateSidecar {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub weights: FileRecord,
    pub next_epoch: usize,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub epoch: usize,
    pub weights_path: PathBuf,
    pub state_path: Option<PathBuf>,
    pub parameter_count: usize,
}

/// Reads and writes `model_epoch_{N}.pth` weight snapshots in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
    interval: usize,
    save_training_state: bool,
}

impl CheckpointManager {
    /// Creates the directory when it does not exist yet.
    pub fn new(
        directory: impl Into<PathBuf>,
        interval: usize,
        save_training_state: bool,
    ) -> Result<Self, TrainingError> {
        let directory = directory.into();
        if interval == 0 {
            return Err(TrainingError::validation(vec![
                "checkpoint.interval must be greater than zero".to_string(),
            ]));
        }
        fs::create_dir_all(&directory).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create checkpoint directory {}: {err}",
                directory.display()
            ))
        })?;
        Ok(Self {
            directory,
            interval,
            save_training_state,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn saves_training_state(&self) -> bool {
        self.save_training_state
    }

    pub fn weights_path(&self, epoch: usize) -> PathBuf {
        self.directory.join(weights_filename(epoch))
    }

    pub fn state_path(&self, epoch: usize) -> PathBuf {
        self.directory.join(state_filename(epoch))
    }

    /// Loads `model_epoch_{epoch}.pth` into `model` in place.
    pub fn resume(
        &self,
        model: &dyn DetectionModel,
        epoch: usize,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let path = self.weights_path(epoch);
        if !path.is_file() {
            return Err(TrainingError::CheckpointNotFound(path));
        }

        let tensors = safetensors::load(&path, &Device::Cpu)
            .map_err(|err| TrainingError::corrupt(&path, err.to_string()))?;
        let parameter_count = tensors.len();
        model
            .load_parameters(tensors)
            .map_err(|err| load_error(&path, err))?;

        log::info!(
            "resumed {} parameter tensors from {}",
            parameter_count,
            path.display()
        );
        let state_path = self.state_path(epoch);
        Ok(CheckpointDescriptor {
            epoch,
            weights_path: path,
            state_path: state_path.is_file().then_some(state_path),
            parameter_count,
        })
    }

    /// Writes the weights reached after epoch index `epoch_index` as
    /// `model_epoch_{epoch_index + 1}.pth`, replacing any existing file.
    pub fn save(
        &self,
        model: &dyn DetectionModel,
        epoch_index: usize,
        state: Option<TrainingStateRequest<'_>>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let epoch = epoch_index + 1;
        let path = self.weights_path(epoch);

        let named_parameters = model.parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::runtime(
                "model contains no parameters to checkpoint",
            ));
        }
        let mut tensors: HashMap<String, Tensor> = HashMap::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let host = var
                .as_tensor()
                .detach()
                .to_device(&Device::Cpu)
                .map_err(|err| {
                    TrainingError::runtime(format!("failed to copy '{name}' to host: {err}"))
                })?;
            tensors.insert(name, host);
        }
        let parameter_count = tensors.len();
        safetensors::save(&tensors, &path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to serialize model weights to {}: {err}",
                path.display()
            ))
        })?;

        let state_path = match state {
            Some(request) => {
                let sidecar = TrainingStateSidecar {
                    version: CHECKPOINT_VERSION,
                    created_unix_timestamp: unix_timestamp(),
                    config_sha256: fingerprint_config(request.config)?,
                    weights: file_record(&path)?,
                    next_epoch: epoch,
                    optimizer: request.optimizer,
                    scheduler: request.scheduler,
                };
                let state_path = self.state_path(epoch);
                write_json(&state_path, &sidecar)?;
                Some(state_path)
            }
            None => None,
        };

        log::info!("saved checkpoint {}", path.display());
        Ok(CheckpointDescriptor {
            epoch,
            weights_path: path,
            state_path,
            parameter_count,
        })
    }

    /// Highest `N` among the `model_epoch_{N}.pth` files present.
    pub fn latest_epoch(&self) -> Result<Option<usize>, TrainingError> {
        let entries = fs::read_dir(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;
        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|err| {
                TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
            })?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(epoch) = parse_weights_filename(&entry.file_name().to_string_lossy()) {
                latest = latest.max(Some(epoch));
            }
        }
        Ok(latest)
    }

    /// Reads the sidecar for `epoch` after checking it still describes the
    /// weights file on disk. `Ok(None)` when no sidecar was written.
    pub fn load_training_state(
        &self,
        epoch: usize,
    ) -> Result<Option<TrainingStateSidecar>, TrainingError> {
        let state_path = self.state_path(epoch);
        if !state_path.is_file() {
            return Ok(None);
        }
        let sidecar: TrainingStateSidecar = read_json(&state_path)?;
        if sidecar.version != CHECKPOINT_VERSION {
            return Err(TrainingError::corrupt(
                &state_path,
                format!(
                    "unsupported checkpoint version {} (expected {})",
                    sidecar.version, CHECKPOINT_VERSION
                ),
            ));
        }
        let weights_path = self.directory.join(&sidecar.weights.filename);
        if sha256_file(&weights_path)? != sidecar.weights.sha256 {
            return Err(TrainingError::corrupt(
                weights_path,
                "weights do not match the recorded training state checksum",
            ));
        }
        Ok(Some(sidecar))
    }
}

/// Borrowed inputs for a training-state sidecar.
pub struct TrainingStateRequest<'a> {
    pub config: &'a TrainingConfig,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
}

pub fn weights_filename(epoch: usize) -> String {
    format!("{WEIGHTS_PREFIX}{epoch}{WEIGHTS_SUFFIX}")
}

pub fn state_filename(epoch: usize) -> String {
    format!("{WEIGHTS_PREFIX}{epoch}{STATE_SUFFIX}")
}

pub fn should_save(epoch_index: usize, interval: usize) -> bool {
    interval > 0 && (epoch_index + 1) % interval == 0
}

fn parse_weights_filename(name: &str) -> Option<usize> {
    name.strip_prefix(WEIGHTS_PREFIX)?
        .strip_suffix(WEIGHTS_SUFFIX)?
        .parse()
        .ok()
}

fn load_error(path: &Path, err: LoadError) -> TrainingError {
    match err {
        LoadError::ShapeMismatch {
            name,
            expected,
            found,
        } => TrainingError::ShapeMismatch {
            name,
            expected,
            found,
        },
        other => TrainingError::corrupt(path, other.to_string()),
    }
}

/// SHA-256 of the JSON config with the resume point cleared, so a resumed
/// run fingerprints like the run that wrote the checkpoint.
pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let mut config = config.clone();
    config.runtime.resume = None;
    let json = serde_json::to_vec(&config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| TrainingError::corrupt(path, err.to_string()))
}
