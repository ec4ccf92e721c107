//! Dataset providers for EAST text detection training.

pub mod annotation;
pub mod error;
pub mod icdar;
pub mod labels;
pub mod memory;
pub mod sample;

/// Label maps are produced at `1 / OUTPUT_STRIDE` of the input resolution.
pub const OUTPUT_STRIDE: usize = 4;

/// Four edge distances plus the rotation angle.
pub const GEOMETRY_CHANNELS: usize = 5;

pub use annotation::{parse_annotations, read_annotations, TextRegion, IGNORE_TRANSCRIPTION};
pub use error::{DataError, Result};
pub use icdar::IcdarDataset;
pub use labels::{rasterize, LabelMaps};
pub use memory::InMemoryDataset;
pub use sample::{DetectionDataset, MapBuffer, Sample};
