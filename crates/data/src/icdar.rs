use std::{
    fs,
    path::{Path, PathBuf},
};

use image::{imageops::FilterType, RgbImage};

use crate::{
    annotation::read_annotations,
    error::{io_error, DataError, Result},
    labels::rasterize,
    sample::{DetectionDataset, MapBuffer, Sample},
    OUTPUT_STRIDE,
};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Clone)]
struct IcdarEntry {
    image: PathBuf,
    ground_truth: PathBuf,
}

/// ICDAR 2015 style dataset: a directory of images and a directory of
/// `gt_<image stem>.txt` annotation files.
///
/// Every image is resized to `input_size x input_size`; annotations are
/// rescaled accordingly before the label maps are rasterised.
#[derive(Debug, Clone)]
pub struct IcdarDataset {
    entries: Vec<IcdarEntry>,
    input_size: usize,
}

impl IcdarDataset {
    pub fn open(
        image_dir: impl AsRef<Path>,
        gt_dir: impl AsRef<Path>,
        input_size: usize,
    ) -> Result<Self> {
        let image_dir = image_dir.as_ref();
        let gt_dir = gt_dir.as_ref();

        if input_size == 0 || input_size % OUTPUT_STRIDE != 0 {
            return Err(DataError::InvalidConfig(format!(
                "input_size must be a positive multiple of {OUTPUT_STRIDE} (got {input_size})"
            )));
        }

        let mut images = Vec::new();
        for entry in fs::read_dir(image_dir).map_err(io_error(image_dir))? {
            let path = entry.map_err(io_error(image_dir))?.path();
            if path.is_file() && has_image_extension(&path) {
                images.push(path);
            }
        }
        images.sort();

        let mut entries = Vec::with_capacity(images.len());
        for image in images {
            let ground_truth = ground_truth_for(&image, gt_dir)
                .ok_or_else(|| DataError::MissingGroundTruth(image.clone()))?;
            entries.push(IcdarEntry {
                image,
                ground_truth,
            });
        }

        log::info!(
            "icdar dataset: {} images from {} (input size {})",
            entries.len(),
            image_dir.display(),
            input_size
        );

        Ok(Self {
            entries,
            input_size,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn image_paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|entry| entry.image.as_path())
    }
}

impl DetectionDataset for IcdarDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let entry = self.entries.get(index).ok_or(DataError::IndexOutOfRange {
            index,
            len: self.entries.len(),
        })?;

        let decoded = image::open(&entry.image)
            .map_err(|source| DataError::Image {
                path: entry.image.clone(),
                source,
            })?
            .to_rgb8();
        let (original_width, original_height) = decoded.dimensions();
        let size = self.input_size as u32;
        let resized = image::imageops::resize(&decoded, size, size, FilterType::Triangle);

        let scale_x = self.input_size as f32 / original_width.max(1) as f32;
        let scale_y = self.input_size as f32 / original_height.max(1) as f32;
        let regions: Vec<_> = read_annotations(&entry.ground_truth)?
            .iter()
            .map(|region| region.scaled(scale_x, scale_y))
            .collect();

        let labels = rasterize(&regions, self.input_size, self.input_size);
        let sample = Sample {
            image: normalize(&resized),
            score_map: labels.score_map,
            geometry_map: labels.geometry_map,
            ignore_mask: labels.ignore_mask,
        };
        sample.validate()?;
        Ok(sample)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn ground_truth_for(image: &Path, gt_dir: &Path) -> Option<PathBuf> {
    let stem = image.file_stem()?.to_str()?;
    [format!("gt_{stem}.txt"), format!("{stem}.txt")]
        .into_iter()
        .map(|name| gt_dir.join(name))
        .find(|path| path.is_file())
}

/// Channel-first layout with values mapped from `[0, 255]` to `[-1, 1]`.
fn normalize(image: &RgbImage) -> MapBuffer {
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);
    let mut buffer = MapBuffer::zeros([3, height, width]);
    for (x, y, pixel) in image.enumerate_pixels() {
        for channel in 0..3 {
            let value = (pixel[channel] as f32 / 255.0 - 0.5) / 0.5;
            buffer.set(channel, y as usize, x as usize, value);
        }
    }
    buffer
}
