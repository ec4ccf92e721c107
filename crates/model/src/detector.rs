use std::{collections::HashMap, f64::consts::PI};

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::{conv2d, ops::sigmoid, Conv2d, Conv2dConfig, Module, VarBuilder, VarMap};
use east_data::GEOMETRY_CHANNELS;

use crate::{
    config::{TextDetectorConfig, OUTPUT_STRIDE},
    model::DetectionModel,
};

/// Compact fully-convolutional EAST-style detector.
///
/// Two stride-2 convolutions bring the input to 1/4 resolution, followed by
/// three 1x1 heads: text score, four edge distances and a rotation angle.
pub struct TextDetector {
    config: TextDetectorConfig,
    device: Device,
    network: DetectorNetwork,
    parameters: Vec<(String, Var)>,
}

impl TextDetector {
    pub fn new(config: TextDetectorConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let network = DetectorNetwork::new(&config, vb)?;

        let mut parameters: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| Error::Msg("detector variable map lock poisoned".into()))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect()
        };
        parameters.sort_by(|a, b| a.0.cmp(&b.0));

        log::debug!(
            "text detector built: {} parameter tensors, {} scalars",
            parameters.len(),
            parameters.iter().map(|(_, var)| var.elem_count()).sum::<usize>()
        );

        Ok(Self {
            config,
            device: device.clone(),
            network,
            parameters,
        })
    }

    pub fn config(&self) -> &TextDetectorConfig {
        &self.config
    }
}

impl DetectionModel for TextDetector {
    fn forward(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        self.network.forward(images)
    }

    fn forward_on(&self, device: &Device, images: &Tensor) -> Result<(Tensor, Tensor)> {
        if device.same_device(&self.device) {
            return self.network.forward(images);
        }
        let mut tensors = HashMap::with_capacity(self.parameters.len());
        for (name, var) in &self.parameters {
            tensors.insert(name.clone(), var.as_tensor().to_device(device)?);
        }
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let replica = DetectorNetwork::new(&self.config, vb)?;
        replica.forward(images)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.parameters.clone()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn unwrapped(&self) -> &dyn DetectionModel {
        self
    }
}

struct DetectorNetwork {
    stem: Conv2d,
    reduce: Conv2d,
    body: Conv2d,
    score_head: Conv2d,
    distance_head: Conv2d,
    angle_head: Conv2d,
    geometry_scope: f64,
}

impl DetectorNetwork {
    fn new(config: &TextDetectorConfig, vb: VarBuilder) -> Result<Self> {
        let width = config.base_channels;
        let downsample = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let pointwise = Conv2dConfig::default();

        Ok(Self {
            stem: conv2d(config.input_channels, width, 3, downsample, vb.pp("stem"))?,
            reduce: conv2d(width, width * 2, 3, downsample, vb.pp("reduce"))?,
            body: conv2d(width * 2, width * 2, 3, same, vb.pp("body"))?,
            score_head: conv2d(width * 2, 1, 1, pointwise, vb.pp("score_head"))?,
            distance_head: conv2d(
                width * 2,
                GEOMETRY_CHANNELS - 1,
                1,
                pointwise,
                vb.pp("distance_head"),
            )?,
            angle_head: conv2d(width * 2, 1, 1, pointwise, vb.pp("angle_head"))?,
            geometry_scope: config.geometry_scope,
        })
    }

    fn forward(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, _, height, width) = images.dims4()?;
        if height % OUTPUT_STRIDE != 0 || width % OUTPUT_STRIDE != 0 {
            return Err(Error::Msg(format!(
                "image size {height}x{width} must be divisible by {}",
                OUTPUT_STRIDE
            )));
        }

        let hidden = self.stem.forward(images)?.relu()?;
        let hidden = self.reduce.forward(&hidden)?.relu()?;
        let hidden = self.body.forward(&hidden)?.relu()?;

        let score = sigmoid(&self.score_head.forward(&hidden)?)?;
        let distances =
            sigmoid(&self.distance_head.forward(&hidden)?)?.affine(self.geometry_scope, 0.0)?;
        // (sigmoid - 0.5) * pi keeps the angle in (-pi/2, pi/2).
        let angle = sigmoid(&self.angle_head.forward(&hidden)?)?.affine(PI, -PI / 2.0)?;
        let geometry = Tensor::cat(&[&distances, &angle], 1)?;

        Ok((score, geometry))
    }
}
