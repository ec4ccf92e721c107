use candle_core::{Error, Result};

/// Output resolution of the detector relative to its input. Shared with the
/// label rasteriser so predictions and targets line up.
pub use east_data::OUTPUT_STRIDE;

/// Hyperparameters for assembling the [`TextDetector`](crate::TextDetector).
#[derive(Debug, Clone, PartialEq)]
pub struct TextDetectorConfig {
    pub input_channels: usize,
    pub base_channels: usize,
    /// Upper bound, in input pixels, of the predicted edge distances.
    pub geometry_scope: f64,
}

impl Default for TextDetectorConfig {
    fn default() -> Self {
        Self {
            input_channels: 3,
            base_channels: 32,
            geometry_scope: 512.0,
        }
    }
}

impl TextDetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 {
            return Err(Error::Msg("input_channels must be greater than zero".into()));
        }
        if self.base_channels == 0 {
            return Err(Error::Msg("base_channels must be greater than zero".into()));
        }
        if !(self.geometry_scope.is_finite() && self.geometry_scope > 0.0) {
            return Err(Error::Msg(format!(
                "geometry_scope must be a positive finite number (got {})",
                self.geometry_scope
            )));
        }
        Ok(())
    }
}
