use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use chrono::Local;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{BatchProgress, EpochSummary},
    TrainingError,
};

const SEPARATOR_WIDTH: usize = 50;

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Progress sink for the training loop: console lines plus optional
/// tensorboard scalars.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<EventFileWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(EventFileWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn event_file(&self) -> Option<&Path> {
        self.tensorboard.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_batch(&mut self, progress: &BatchProgress) {
        if self.settings.enable_stdout {
            println!("{}", batch_line(progress));
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = progress.global_step() as i64;
            let mut scalars = vec![("train/batch_loss", progress.loss)];
            if let Some(parts) = progress.components {
                scalars.push(("train/classify_loss", parts.classify));
                scalars.push(("train/angle_loss", parts.angle));
                scalars.push(("train/iou_loss", parts.iou));
            }
            for (tag, value) in scalars {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    log::warn!("dropping tensorboard scalar {tag}: {err}");
                }
            }
        }
    }

    pub fn log_epoch(&mut self, summary: &EpochSummary) {
        if self.settings.enable_stdout {
            for line in epoch_lines(summary, &Local::now().format("%a %b %e %H:%M:%S %Y").to_string()) {
                println!("{line}");
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = summary.epoch as i64;
            for (tag, value) in [
                ("train/epoch_loss", summary.mean_loss),
                ("train/epoch_time", summary.elapsed.as_secs_f64()),
                ("train/learning_rate", summary.learning_rate),
            ] {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    log::warn!("dropping tensorboard scalar {tag}: {err}");
                }
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }
}

pub fn batch_line(progress: &BatchProgress) -> String {
    format!(
        "Epoch is [{}/{}], mini-batch is [{}/{}], time consumption is {:.8}, batch_loss is {:.8}",
        progress.epoch + 1,
        progress.epoch_iter,
        progress.batch + 1,
        progress.batches,
        progress.elapsed.as_secs_f64(),
        progress.loss
    )
}

pub fn epoch_lines(summary: &EpochSummary, timestamp: &str) -> [String; 3] {
    [
        format!(
            "epoch_loss is {:.8}, epoch_time is {:.8}",
            summary.mean_loss,
            summary.elapsed.as_secs_f64()
        ),
        timestamp.to_string(),
        "=".repeat(SEPARATOR_WIDTH),
    ]
}

/// Appends TFRecord-framed `Event` protos to `events.out.tfevents.*`.
struct EventFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl EventFileWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        log::info!("writing tensorboard events to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_record(&event)
    }

    fn write_record(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let header_crc = masked_crc32c(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32c(&data).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&header_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for EventFileWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing checksum: CRC32C (Castagnoli), rotated and offset.
fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::loss::LossComponents;

    fn progress() -> BatchProgress {
        BatchProgress {
            epoch: 0,
            epoch_iter: 600,
            batch: 9,
            batches: 125,
            elapsed: Duration::from_millis(250),
            loss: 0.5,
            components: Some(LossComponents {
                classify: 0.1,
                angle: 0.02,
                iou: 0.2,
            }),
        }
    }

    #[test]
    fn batch_line_uses_one_based_counters() {
        assert_eq!(
            batch_line(&progress()),
            "Epoch is [1/600], mini-batch is [10/125], time consumption is 0.25000000, batch_loss is 0.50000000"
        );
    }

    #[test]
    fn epoch_block_ends_with_separator() {
        let summary = EpochSummary {
            epoch: 4,
            mean_loss: 1.25,
            batch_count: 3,
            elapsed: Duration::from_secs(2),
            learning_rate: 1e-3,
        };
        let lines = epoch_lines(&summary, "Mon Jan  1 00:00:00 2024");
        assert_eq!(lines[0], "epoch_loss is 1.25000000, epoch_time is 2.00000000");
        assert_eq!(lines[1], "Mon Jan  1 00:00:00 2024");
        assert_eq!(lines[2], "=".repeat(50));
    }

    #[test]
    fn framing_checksum_is_masked_castagnoli() {
        assert_eq!(crc32c::crc32c(b"123456789"), 0xe306_9283);
        assert_eq!(masked_crc32c(b"123456789"), 0xc78a_b0e5);
    }

    #[test]
    fn scalar_values_carry_their_tag_in_field_one() {
        let value = summary::Value {
            tag: "train/batch_loss".to_string(),
            simple_value: Some(1.0),
        };
        let bytes = value.encode_to_vec();
        // Field 1, wire type 2, followed by the tag length.
        assert_eq!(bytes[0], 0x0a);
        assert_eq!(bytes[1] as usize, "train/batch_loss".len());
        assert_eq!(&bytes[2..18], b"train/batch_loss");
        // Field 2, wire type 5 (fixed32 float).
        assert_eq!(bytes[18], 0x15);
        assert!(!bytes.contains(&0x3a));
    }

    #[test]
    fn event_records_are_framed_with_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(dir.path().to_path_buf()),
            tensorboard_flush_every_n: 1,
        })
        .unwrap();
        logger.log_batch(&progress());
        logger.flush();

        let path = logger.event_file().unwrap().to_path_buf();
        let bytes = fs::read(path).unwrap();

        // One record per scalar: batch loss plus three components.
        let mut offset = 0;
        let mut tags = Vec::new();
        while offset < bytes.len() {
            let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            let header_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(header_crc, masked_crc32c(&bytes[offset..offset + 8]));
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc =
                u32::from_le_bytes(bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap());
            assert_eq!(data_crc, masked_crc32c(data));
            let event = Event::decode(data).unwrap();
            assert_eq!(event.step, 9);
            tags.push(event.summary.unwrap().value[0].tag.clone());
            offset += 16 + len;
        }
        assert_eq!(
            tags,
            ["train/batch_loss", "train/classify_loss", "train/angle_loss", "train/iou_loss"]
        );
    }
}
