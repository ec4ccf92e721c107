use crate::{
    annotation::TextRegion,
    error::{DataError, Result},
    labels::rasterize,
    sample::{DetectionDataset, MapBuffer, Sample},
    OUTPUT_STRIDE,
};

/// Dataset backed by samples held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Result<Self> {
        for sample in &samples {
            sample.validate()?;
        }
        Ok(Self { samples })
    }

    /// Builds `count` square images containing one bright text block each.
    /// The block shifts horizontally with the sample index so samples differ.
    pub fn synthetic(count: usize, input_size: usize) -> Result<Self> {
        if input_size == 0 || input_size % OUTPUT_STRIDE != 0 {
            return Err(DataError::InvalidConfig(format!(
                "input_size must be a positive multiple of {OUTPUT_STRIDE} (got {input_size})"
            )));
        }

        let size = input_size as f32;
        let samples = (0..count)
            .map(|index| {
                let x0 = size * (0.2 + 0.05 * (index % 4) as f32);
                let y0 = size * 0.25;
                let (x1, y1) = (x0 + size * 0.4, y0 + size * 0.3);
                let region = TextRegion {
                    vertices: [(x0, y0), (x1, y0), (x1, y1), (x0, y1)],
                    ignored: false,
                };

                let mut image = MapBuffer::zeros([3, input_size, input_size]);
                for y in 0..input_size {
                    for x in 0..input_size {
                        let inside = region.contains(x as f32 + 0.5, y as f32 + 0.5);
                        for channel in 0..3 {
                            image.set(channel, y, x, if inside { 1.0 } else { -1.0 });
                        }
                    }
                }

                let labels = rasterize(&[region], input_size, input_size);
                Sample {
                    image,
                    score_map: labels.score_map,
                    geometry_map: labels.geometry_map,
                    ignore_mask: labels.ignore_mask,
                }
            })
            .collect();

        Self::new(samples)
    }

    pub fn push(&mut self, sample: Sample) -> Result<()> {
        sample.validate()?;
        self.samples.push(sample);
        Ok(())
    }
}

impl DetectionDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or(DataError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            })
    }
}
