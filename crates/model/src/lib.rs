pub mod config;
pub mod detector;
pub mod model;

pub use config::{TextDetectorConfig, OUTPUT_STRIDE};
pub use detector::TextDetector;
pub use model::{assign_parameters, DetectionModel, LoadError};
