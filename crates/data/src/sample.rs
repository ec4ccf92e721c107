use crate::error::{DataError, Result};

/// Dense `f32` buffer in channel-first layout `[channels, height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MapBuffer {
    pub data: Vec<f32>,
    pub shape: [usize; 3],
}

impl MapBuffer {
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self {
            data: vec![0.0; shape.iter().product()],
            shape,
        }
    }

    pub fn from_vec(data: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DataError::Shape(format!(
                "buffer of {} values cannot have shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { data, shape })
    }

    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }

    pub fn get(&self, channel: usize, y: usize, x: usize) -> f32 {
        self.data[self.offset(channel, y, x)]
    }

    pub fn set(&mut self, channel: usize, y: usize, x: usize, value: f32) {
        let offset = self.offset(channel, y, x);
        self.data[offset] = value;
    }

    fn offset(&self, channel: usize, y: usize, x: usize) -> usize {
        (channel * self.shape[1] + y) * self.shape[2] + x
    }
}

/// One training example: the normalised image and its label maps at 1/4 resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// `[3, H, W]`, values in `[-1, 1]`.
    pub image: MapBuffer,
    /// `[1, H/4, W/4]`, 1 inside text regions.
    pub score_map: MapBuffer,
    /// `[5, H/4, W/4]`: distances to top, bottom, left, right edges, then angle.
    pub geometry_map: MapBuffer,
    /// `[1, H/4, W/4]`, 1 where the region is marked as don't-care.
    pub ignore_mask: MapBuffer,
}

impl Sample {
    /// Checks the relative shapes of the four buffers.
    pub fn validate(&self) -> Result<()> {
        let [_, height, width] = self.image.shape;
        let map_hw = [height / crate::OUTPUT_STRIDE, width / crate::OUTPUT_STRIDE];
        let checks = [
            ("score_map", &self.score_map, 1),
            ("geometry_map", &self.geometry_map, crate::GEOMETRY_CHANNELS),
            ("ignore_mask", &self.ignore_mask, 1),
        ];
        for (label, buffer, channels) in checks {
            if buffer.shape != [channels, map_hw[0], map_hw[1]] {
                return Err(DataError::Shape(format!(
                    "{label} has shape {:?}, expected {:?} for image {:?}",
                    buffer.shape,
                    [channels, map_hw[0], map_hw[1]],
                    self.image.shape
                )));
            }
        }
        Ok(())
    }
}

/// Random-access source of training samples.
pub trait DetectionDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
