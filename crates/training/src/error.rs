use std::path::PathBuf;

use east_data::DataError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("checkpoint {} is corrupt: {reason}", .path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("checkpoint parameter '{name}' has shape {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("data pipeline failed: {0}")]
    Data(#[from] DataError),

    #[error("computation failed: {0}")]
    Compute(String),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors raised before any epoch could run.
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConfigFormat(_)
                | Self::Validation(_)
                | Self::Initialization(_)
                | Self::CheckpointNotFound(_)
                | Self::CheckpointCorrupt { .. }
                | Self::ShapeMismatch { .. }
        )
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_compute_error(err: candle_core::Error) -> TrainingError {
    TrainingError::Compute(err.to_string())
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::Runtime(err.to_string())
}
