use std::{path::PathBuf, str::FromStr};

use clap::{ArgGroup, Parser};
use east_training::{ResumeFrom, Trainer, TrainingConfig, TrainingError};
use serde_json::{Map, Number, Value};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "EAST text detector training CLI", long_about = None)]
#[command(group(ArgGroup::new("start").args(["resume_epoch", "resume_latest", "cold_start"])))]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        value_name = "N",
        help = "Load model_epoch_N.pth and continue at epoch index N"
    )]
    resume_epoch: Option<usize>,

    #[arg(long, help = "Resume from the highest-numbered checkpoint if one exists")]
    resume_latest: bool,

    #[arg(long, help = "Ignore any configured resume point and start at epoch 0")]
    cold_start: bool,
}

impl Args {
    fn resume_override(&self) -> Option<Option<ResumeFrom>> {
        if let Some(epoch) = self.resume_epoch {
            Some(Some(ResumeFrom::Epoch(epoch)))
        } else if self.resume_latest {
            Some(Some(ResumeFrom::Latest))
        } else if self.cold_start {
            Some(None)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(resume) = args.resume_override() {
        config.runtime.resume = resume;
    }

    config.validate()?;

    let mut trainer = Trainer::new(config)?;
    if let Some(descriptor) = trainer.resume()? {
        println!(
            "resumed from checkpoint {} ({} tensors)",
            descriptor.weights_path.display(),
            descriptor.parameter_count
        );
    }

    let summary = trainer.train()?;
    log::info!(
        "finished {} epoch(s) starting at epoch {}; {} checkpoint(s) written",
        summary.epochs_run,
        summary.start_epoch,
        summary.checkpoints.len()
    );
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments = parse_path(path)?;
    if segments.is_empty() {
        return Err(TrainingError::runtime("override path must not be empty"));
    }
    assign_at_path(value, &segments, new_value)
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

/// `a.b[2].c` style paths.
fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::runtime(format!(
                        "invalid index in override path '{}': {}",
                        segment, err
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn object_at<'a>(
    value: &'a mut Value,
    key: &str,
) -> Result<&'a mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{}' points to non-object value",
            key
        ))
    })
}

fn array_at<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Vec<Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Array(Vec::new());
    }
    value.as_array_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{}' expects array value",
            key
        ))
    })
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    let map = object_at(target, &segment.key)?;
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    let slot = match segment.index {
        Some(array_index) => {
            let array = array_at(entry, &segment.key)?;
            if array.len() <= array_index {
                array.resize(array_index + 1, Value::Null);
            }
            &mut array[array_index]
        }
        None => entry,
    };
    assign_at_path(slot, rest, new_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TrainingConfig {
        toml::from_str(
            r#"
            [data]
            train_img_path = "/data/img"
            train_gt_path = "/data/gt"

            [checkpoint]
            directory = "/ckpt"
            "#,
        )
        .unwrap()
    }

    fn overrides(pairs: &[&str]) -> Vec<OverrideArg> {
        pairs.iter().map(|pair| pair.parse().unwrap()).collect()
    }

    #[test]
    fn dotted_overrides_replace_nested_values() {
        let config = apply_overrides(
            base_config(),
            &overrides(&[
                "data.batch_size=4",
                "optimizer.learning_rate=0.01",
                "runtime.logging.enable_stdout=false",
                "scheduler.milestones=[10, 20]",
            ]),
        )
        .unwrap();
        assert_eq!(config.data.batch_size, 4);
        assert_eq!(config.optimizer.learning_rate, 0.01);
        assert!(!config.runtime.logging.enable_stdout);
        assert_eq!(config.scheduler.milestones, Some(vec![10, 20]));
    }

    #[test]
    fn resume_can_be_overridden_as_text_or_object() {
        let latest =
            apply_overrides(base_config(), &overrides(&["runtime.resume=latest"])).unwrap();
        assert_eq!(latest.runtime.resume, Some(ResumeFrom::Latest));

        let epoch =
            apply_overrides(base_config(), &overrides(&[r#"runtime.resume={"epoch": 7}"#]))
                .unwrap();
        assert_eq!(epoch.runtime.resume, Some(ResumeFrom::Epoch(7)));
    }

    #[test]
    fn indexed_segments_extend_arrays() {
        let mut value = serde_json::json!({});
        set_value_at_path(&mut value, "a.list[2]", Value::from(5)).unwrap();
        assert_eq!(value, serde_json::json!({"a": {"list": [null, null, 5]}}));
    }

    #[test]
    fn scalar_in_the_middle_of_a_path_is_an_error() {
        let mut value = serde_json::json!({"a": 1});
        assert!(set_value_at_path(&mut value, "a.b", Value::from(2)).is_err());
    }

    #[test]
    fn override_without_equals_is_rejected() {
        assert!("data.batch_size".parse::<OverrideArg>().is_err());
    }

    #[test]
    fn resume_flags_are_mutually_exclusive() {
        let parsed = Args::try_parse_from([
            "train",
            "--config",
            "c.toml",
            "--resume-epoch",
            "3",
            "--cold-start",
        ]);
        assert!(parsed.is_err());

        let args = Args::try_parse_from(["train", "--config", "c.toml", "--resume-epoch", "3"])
            .unwrap();
        assert_eq!(args.resume_override(), Some(Some(ResumeFrom::Epoch(3))));

        let args = Args::try_parse_from(["train", "--config", "c.toml", "--cold-start"]).unwrap();
        assert_eq!(args.resume_override(), Some(None));
    }
}
