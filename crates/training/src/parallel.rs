use candle_core::{Device, Result, Tensor, Var};
use east_model::DetectionModel;
use rayon::prelude::*;

/// Name prefix reported for the parameters of a replicated model.
pub const REPLICA_PREFIX: &str = "module.";

/// Splits each batch across devices and gathers the outputs on the primary.
///
/// Shard 0 runs on the wrapped model; every other shard runs on a replica
/// device with parameter copies that stay on the autograd graph of the
/// primary parameters, so one backward pass updates a single set of weights.
pub struct ReplicatedModel {
    inner: Box<dyn DetectionModel>,
    replicas: Vec<Device>,
}

impl ReplicatedModel {
    pub fn new(inner: Box<dyn DetectionModel>, replicas: Vec<Device>) -> Self {
        Self { inner, replicas }
    }

    pub fn device_count(&self) -> usize {
        1 + self.replicas.len()
    }
}

impl DetectionModel for ReplicatedModel {
    fn forward(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch = images.dim(0)?;
        let shards = batch.min(self.device_count());
        if shards <= 1 {
            return self.inner.forward(images);
        }

        let chunks = images.chunk(shards, 0)?;
        let primary = self.inner.device();
        let inner = self.inner.as_ref();
        let targets: Vec<Option<&Device>> = std::iter::once(None)
            .chain(self.replicas.iter().map(Some))
            .collect();

        let outputs: Vec<Result<(Tensor, Tensor)>> = chunks
            .par_iter()
            .zip(targets.par_iter())
            .map(|(chunk, target)| match target {
                None => inner.forward(chunk),
                Some(device) => {
                    let local = chunk.to_device(device)?;
                    let (score, geometry) = inner.forward_on(device, &local)?;
                    Ok((score.to_device(primary)?, geometry.to_device(primary)?))
                }
            })
            .collect();

        let mut scores = Vec::with_capacity(outputs.len());
        let mut geometries = Vec::with_capacity(outputs.len());
        for output in outputs {
            let (score, geometry) = output?;
            scores.push(score);
            geometries.push(geometry);
        }
        Ok((Tensor::cat(&scores, 0)?, Tensor::cat(&geometries, 0)?))
    }

    fn forward_on(&self, device: &Device, images: &Tensor) -> Result<(Tensor, Tensor)> {
        self.inner.forward_on(device, images)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.inner
            .parameters()
            .into_iter()
            .map(|(name, var)| (format!("{REPLICA_PREFIX}{name}"), var))
            .collect()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn unwrapped(&self) -> &dyn DetectionModel {
        self.inner.unwrapped()
    }
}

/// Wraps `model` for data-parallel execution when replica devices exist.
pub fn maybe_replicate(
    model: Box<dyn DetectionModel>,
    replicas: &[Device],
) -> (Box<dyn DetectionModel>, bool) {
    if replicas.is_empty() {
        return (model, false);
    }
    log::info!(
        "replicating model across {} devices",
        replicas.len() + 1
    );
    (
        Box::new(ReplicatedModel::new(model, replicas.to_vec())),
        true,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use candle_core::DType;
    use east_model::{TextDetector, TextDetectorConfig};

    use super::*;

    fn detector() -> Box<dyn DetectionModel> {
        let config = TextDetectorConfig {
            base_channels: 4,
            ..TextDetectorConfig::default()
        };
        Box::new(TextDetector::new(config, &Device::Cpu).unwrap())
    }

    fn names(model: &dyn DetectionModel) -> BTreeSet<String> {
        model.parameters().into_iter().map(|(name, _)| name).collect()
    }

    #[test]
    fn no_replicas_leaves_model_untouched() {
        let model = detector();
        let expected = names(model.as_ref());
        let (model, replicated) = maybe_replicate(model, &[]);
        assert!(!replicated);
        assert_eq!(names(model.as_ref()), expected);
    }

    #[test]
    fn unwrapping_restores_canonical_names() {
        let model = detector();
        let expected = names(model.as_ref());

        let (wrapped, replicated) = maybe_replicate(model, &[Device::Cpu]);
        assert!(replicated);
        assert!(names(wrapped.as_ref())
            .iter()
            .all(|name| name.starts_with(REPLICA_PREFIX)));
        assert_eq!(names(wrapped.unwrapped()), expected);
    }

    #[test]
    fn sharded_forward_matches_single_device() {
        let base = detector();
        let images = Tensor::randn(0f32, 1.0, (3, 3, 8, 8), &Device::Cpu).unwrap();
        let (expected_score, expected_geo) = base.forward(&images).unwrap();

        let wrapped = ReplicatedModel::new(base, vec![Device::Cpu]);
        let (score, geometry) = wrapped.forward(&images).unwrap();

        assert_eq!(score.dims(), expected_score.dims());
        let diff = (score - expected_score)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
        let diff = (geometry - expected_geo)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-3);
    }

    #[test]
    fn uneven_shards_are_gathered_in_batch_order() {
        let base = detector();
        let images = Tensor::randn(0f32, 1.0, (5, 3, 8, 8), &Device::Cpu).unwrap();
        let (expected, _) = base.forward(&images).unwrap();

        let wrapped = ReplicatedModel::new(base, vec![Device::Cpu, Device::Cpu]);
        assert_eq!(wrapped.device_count(), 3);
        let (score, _) = wrapped.forward(&images).unwrap();
        assert_eq!(score.dims(), expected.dims());

        for row in 0..5 {
            let diff = (score.get(row).unwrap() - expected.get(row).unwrap())
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-5, "row {row} out of place");
        }
    }

    #[test]
    fn gradients_reach_primary_parameters_through_replicas() {
        let wrapped = ReplicatedModel::new(detector(), vec![Device::Cpu]);
        let images = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let (score, _) = wrapped.forward(&images).unwrap();
        let grads = score.sum_all().unwrap().backward().unwrap();

        for (name, var) in wrapped.unwrapped().parameters() {
            if name.starts_with("score_head") || name.starts_with("stem") {
                assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
            }
        }
    }

    #[test]
    fn replicated_model_loads_prefixed_snapshots() {
        let wrapped = ReplicatedModel::new(detector(), vec![Device::Cpu]);
        let snapshot: HashMap<String, Tensor> = wrapped
            .parameters()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().zeros_like().unwrap()))
            .collect();
        wrapped.load_parameters(snapshot).unwrap();

        let total: f32 = wrapped
            .unwrapped()
            .parameters()
            .iter()
            .map(|(_, var)| {
                var.as_tensor()
                    .to_dtype(DType::F32)
                    .unwrap()
                    .abs()
                    .unwrap()
                    .sum_all()
                    .unwrap()
                    .to_scalar::<f32>()
                    .unwrap()
            })
            .sum();
        assert_eq!(total, 0.0);
    }
}
