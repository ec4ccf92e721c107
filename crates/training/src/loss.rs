use candle_core::Tensor;

use crate::{error::to_compute_error, TrainingError};

const DICE_SMOOTHING: f64 = 1e-5;
const GEOMETRY_CHANNELS: usize = 5;

/// Scalar sub-losses reported on diagnostic batches.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossComponents {
    pub classify: f64,
    pub angle: f64,
    pub iou: f64,
}

#[derive(Debug)]
pub struct LossOutput {
    /// Differentiable scalar.
    pub loss: Tensor,
    pub components: Option<LossComponents>,
}

/// EAST objective: dice loss on the score map plus IoU and angle losses on
/// the geometry map, both restricted to positive pixels.
#[derive(Debug, Clone)]
pub struct DetectionLoss {
    angle_weight: f64,
}

impl Default for DetectionLoss {
    fn default() -> Self {
        Self { angle_weight: 10.0 }
    }
}

impl DetectionLoss {
    pub fn new(angle_weight: f64) -> Self {
        Self { angle_weight }
    }

    pub fn angle_weight(&self) -> f64 {
        self.angle_weight
    }

    /// `verbose` only decides whether components are returned.
    pub fn compute(
        &self,
        gt_score: &Tensor,
        pred_score: &Tensor,
        gt_geo: &Tensor,
        pred_geo: &Tensor,
        ignored: &Tensor,
        verbose: bool,
    ) -> Result<LossOutput, TrainingError> {
        check_shapes(gt_score, pred_score, gt_geo, pred_geo, ignored)?;

        let positive = gt_score.sum_all().map_err(to_compute_error)?;
        let positive_count = positive.to_scalar::<f32>().map_err(to_compute_error)?;
        if positive_count < 1.0 {
            // No text in the batch: zero loss that still reaches every output.
            let loss = (pred_score.sum_all().map_err(to_compute_error)?
                + pred_geo.sum_all().map_err(to_compute_error)?)
            .map_err(to_compute_error)?
            .affine(0.0, 0.0)
            .map_err(to_compute_error)?;
            return Ok(LossOutput {
                loss,
                components: verbose.then(LossComponents::default),
            });
        }

        let classify = dice_loss(gt_score, pred_score, ignored).map_err(to_compute_error)?;
        let (iou_map, angle_map) = geometry_loss_maps(gt_geo, pred_geo).map_err(to_compute_error)?;
        let iou = masked_mean(&iou_map, gt_score, &positive).map_err(to_compute_error)?;
        let angle = masked_mean(&angle_map, gt_score, &positive).map_err(to_compute_error)?;

        let loss = angle
            .affine(self.angle_weight, 0.0)
            .and_then(|weighted| weighted + &iou)
            .and_then(|geometry| geometry + &classify)
            .map_err(to_compute_error)?;

        let components = if verbose {
            Some(LossComponents {
                classify: scalar(&classify)?,
                angle: scalar(&angle)?,
                iou: scalar(&iou)?,
            })
        } else {
            None
        };

        Ok(LossOutput { loss, components })
    }
}

fn check_shapes(
    gt_score: &Tensor,
    pred_score: &Tensor,
    gt_geo: &Tensor,
    pred_geo: &Tensor,
    ignored: &Tensor,
) -> Result<(), TrainingError> {
    let score_dims = gt_score.dims();
    if score_dims.len() != 4 || score_dims[1] != 1 {
        return Err(TrainingError::compute(format!(
            "score map must be [batch, 1, height, width], got {:?}",
            score_dims
        )));
    }
    if pred_score.dims() != score_dims || ignored.dims() != score_dims {
        return Err(TrainingError::compute(format!(
            "score shapes disagree: gt {:?}, pred {:?}, ignored {:?}",
            score_dims,
            pred_score.dims(),
            ignored.dims()
        )));
    }
    let expected_geo = [score_dims[0], GEOMETRY_CHANNELS, score_dims[2], score_dims[3]];
    if gt_geo.dims() != expected_geo || pred_geo.dims() != expected_geo {
        return Err(TrainingError::compute(format!(
            "geometry shapes disagree: expected {:?}, gt {:?}, pred {:?}",
            expected_geo,
            gt_geo.dims(),
            pred_geo.dims()
        )));
    }
    Ok(())
}

/// `1 - 2|gt * pred| / (|gt| + |pred| + eps)` with ignored pixels zeroed in
/// the prediction.
fn dice_loss(gt: &Tensor, pred: &Tensor, ignored: &Tensor) -> candle_core::Result<Tensor> {
    let keep = ignored.affine(-1.0, 1.0)?;
    let pred = pred.mul(&keep)?;
    let intersection = gt.mul(&pred)?.sum_all()?;
    let union = ((gt.sum_all()? + pred.sum_all()?)?).affine(1.0, DICE_SMOOTHING)?;
    intersection.div(&union)?.affine(-2.0, 1.0)
}

/// Per-pixel `-log((inter + 1) / (union + 1))` and `1 - cos(delta angle)`.
fn geometry_loss_maps(gt: &Tensor, pred: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
    let channel = |t: &Tensor, i: usize| t.narrow(1, i, 1);
    let (gt_top, gt_bottom, gt_left, gt_right, gt_angle) = (
        channel(gt, 0)?,
        channel(gt, 1)?,
        channel(gt, 2)?,
        channel(gt, 3)?,
        channel(gt, 4)?,
    );
    let (pred_top, pred_bottom, pred_left, pred_right, pred_angle) = (
        channel(pred, 0)?,
        channel(pred, 1)?,
        channel(pred, 2)?,
        channel(pred, 3)?,
        channel(pred, 4)?,
    );

    let gt_area = ((&gt_top + &gt_bottom)? * (&gt_left + &gt_right)?)?;
    let pred_area = ((&pred_top + &pred_bottom)? * (&pred_left + &pred_right)?)?;
    let overlap_w = (gt_left.minimum(&pred_left)? + gt_right.minimum(&pred_right)?)?;
    let overlap_h = (gt_top.minimum(&pred_top)? + gt_bottom.minimum(&pred_bottom)?)?;
    let intersection = (overlap_w * overlap_h)?;
    let union = ((gt_area + pred_area)? - &intersection)?;

    let iou = intersection
        .affine(1.0, 1.0)?
        .div(&union.affine(1.0, 1.0)?)?
        .log()?
        .neg()?;
    let angle = (pred_angle - gt_angle)?.cos()?.affine(-1.0, 1.0)?;
    Ok((iou, angle))
}

/// `sum(map * gt_score) / sum(gt_score)`.
fn masked_mean(map: &Tensor, gt_score: &Tensor, positive: &Tensor) -> candle_core::Result<Tensor> {
    map.mul(gt_score)?.sum_all()?.div(positive)
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .to_scalar::<f32>()
        .map(f64::from)
        .map_err(to_compute_error)
}
