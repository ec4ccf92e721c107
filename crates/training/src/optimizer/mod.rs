use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone)]
pub enum OptimizerConfig {
    /// Weight decay is added to the gradient.
    Adam(AdamConfig),
    /// Weight decay shrinks the parameter directly.
    AdamW(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    fn hyperparameters(&self) -> &AdamConfig {
        match self {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg,
        }
    }

    fn hyperparameters_mut(&mut self) -> &mut AdamConfig {
        match self {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Adam(_) => "adam",
            OptimizerConfig::AdamW(_) => "adamw",
        }
    }
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        if value.learning_rate <= 0.0 || !value.learning_rate.is_finite() {
            return Err(TrainingError::initialization(format!(
                "optimizer learning rate must be positive (got {})",
                value.learning_rate
            )));
        }
        let cfg = AdamConfig {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        };
        Ok(match value.algorithm {
            config::OptimizerType::Adam => OptimizerConfig::Adam(cfg),
            config::OptimizerType::AdamW => OptimizerConfig::AdamW(cfg),
        })
    }
}

/// Adam-family optimizer over the named parameters of a detector.
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
            });
        }

        log::debug!(
            "{} optimizer tracking {} parameter tensors",
            config.name(),
            params.len()
        );

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.hyperparameters().learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.hyperparameters_mut().learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Backpropagates `loss` into a fresh gradient store and applies one
    /// update. Nothing accumulates between calls.
    pub fn apply_gradients(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        let mut grads = loss.backward().map_err(to_runtime_error)?;
        self.step(&mut grads)
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut pending = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                pending.push((index, grad.to_dtype(DType::F32).map_err(to_runtime_error)?));
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let decoupled = matches!(self.config, OptimizerConfig::AdamW(_));
        let cfg = *self.config.hyperparameters();

        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in pending {
            let slot = &mut self.params[index];
            let base = slot
                .param
                .as_tensor()
                .detach()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;

            let grad = if !decoupled && cfg.weight_decay != 0.0 {
                let decay = base.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let decayed = if decoupled && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            let next = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
            });
        }

        Ok(OptimizerState {
            algorithm: self.config.name().to_string(),
            step: self.step,
            learning_rate: self.learning_rate(),
            parameters,
        })
    }

    /// Restores moments and step count. The current learning rate is kept;
    /// the scheduler owns it.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        if state.algorithm != self.config.name() {
            return Err(TrainingError::runtime(format!(
                "optimizer state was written by '{}' but '{}' is configured",
                state.algorithm,
                self.config.name()
            )));
        }

        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != saved.shape.as_slice() {
                return Err(TrainingError::ShapeMismatch {
                    name: slot.name.clone(),
                    expected: dims.to_vec(),
                    found: saved.shape,
                });
            }
            let expected = numel(dims);
            if expected != saved.first_moment.len() || expected != saved.second_moment.len() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            let first = Tensor::from_vec(saved.first_moment, dims, device).map_err(to_runtime_error)?;
            let second =
                Tensor::from_vec(saved.second_moment, dims, device).map_err(to_runtime_error)?;
            restored.push((first, second));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        Ok(())
    }
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub algorithm: String,
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn adam(weight_decay: f64, algorithm: config::OptimizerType) -> OptimizerConfig {
        let cfg = config::OptimizerConfig {
            algorithm,
            learning_rate: 0.1,
            weight_decay,
            ..config::OptimizerConfig::default()
        };
        OptimizerConfig::try_from(&cfg).unwrap()
    }

    fn scalar_param(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap()
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn first_adam_step_moves_by_learning_rate() {
        let param = scalar_param(1.0);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), param.clone())],
            adam(0.0, config::OptimizerType::Adam),
        )
        .unwrap();

        let loss = param.as_tensor().sqr().unwrap().sum_all().unwrap();
        optimizer.apply_gradients(&loss).unwrap();

        assert!((value(&param) - 0.9).abs() < 1e-4);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn repeated_steps_reduce_a_quadratic() {
        let param = scalar_param(2.0);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), param.clone())],
            adam(0.0, config::OptimizerType::AdamW),
        )
        .unwrap();
        for _ in 0..30 {
            let loss = param.as_tensor().sqr().unwrap().sum_all().unwrap();
            optimizer.apply_gradients(&loss).unwrap();
        }
        assert!(value(&param).abs() < 1.0);
    }

    #[test]
    fn decoupled_decay_shrinks_weights_without_gradient_signal() {
        let param = scalar_param(1.0);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), param.clone())],
            adam(0.5, config::OptimizerType::AdamW),
        )
        .unwrap();
        let loss = param.as_tensor().affine(0.0, 0.0).unwrap().sum_all().unwrap();
        optimizer.apply_gradients(&loss).unwrap();
        assert!((value(&param) - 0.95).abs() < 1e-4);
    }

    #[test]
    fn learning_rate_can_be_overridden() {
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), scalar_param(1.0))],
            adam(0.0, config::OptimizerType::Adam),
        )
        .unwrap();
        optimizer.set_learning_rate(0.01);
        assert_eq!(optimizer.learning_rate(), 0.01);
    }

    #[test]
    fn state_round_trips_moments() {
        let param = scalar_param(1.0);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), param.clone())],
            adam(0.0, config::OptimizerType::Adam),
        )
        .unwrap();
        let loss = param.as_tensor().sqr().unwrap().sum_all().unwrap();
        optimizer.apply_gradients(&loss).unwrap();
        let state = optimizer.state().unwrap();

        let mut fresh = TrainerOptimizer::new(
            vec![("w".into(), scalar_param(1.0))],
            adam(0.0, config::OptimizerType::Adam),
        )
        .unwrap();
        fresh.load_state(state.clone()).unwrap();
        let restored = fresh.state().unwrap();
        assert_eq!(restored.step, 1);
        assert_eq!(
            restored.parameters[0].first_moment,
            state.parameters[0].first_moment
        );
    }

    #[test]
    fn state_from_another_algorithm_is_rejected() {
        let adam_opt = TrainerOptimizer::new(
            vec![("w".into(), scalar_param(1.0))],
            adam(0.0, config::OptimizerType::Adam),
        )
        .unwrap();
        let mut adamw_opt = TrainerOptimizer::new(
            vec![("w".into(), scalar_param(1.0))],
            adam(0.0, config::OptimizerType::AdamW),
        )
        .unwrap();
        assert!(adamw_opt.load_state(adam_opt.state().unwrap()).is_err());
    }
}
