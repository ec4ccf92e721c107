use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no ground truth file for image {0}")]
    MissingGroundTruth(PathBuf),

    #[error("malformed annotation {path}:{line}: {reason}")]
    Annotation {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("sample index {index} out of range for dataset of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid dataset configuration: {0}")]
    InvalidConfig(String),

    #[error("inconsistent sample shapes: {0}")]
    Shape(String),
}

pub(crate) fn io_error(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> DataError {
    let path = path.into();
    move |source| DataError::Io { path, source }
}
