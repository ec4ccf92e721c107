use std::collections::HashMap;

use candle_core::{Device, Result, Tensor, Var};
use thiserror::Error;

/// Capabilities the training driver relies on. Implemented by the base
/// detector and by wrappers that distribute it across devices.
pub trait DetectionModel: Send + Sync {
    /// Maps an image batch `[B, C, H, W]` to `(score [B, 1, H/4, W/4], geometry [B, 5, H/4, W/4])`.
    fn forward(&self, images: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Runs the forward pass on `device` using copies of the parameters
    /// that remain attached to the autograd graph of the originals.
    fn forward_on(&self, device: &Device, images: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Trainable parameters, sorted by name.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn device(&self) -> &Device;

    /// The underlying model with canonical parameter names.
    fn unwrapped(&self) -> &dyn DetectionModel;

    /// Replaces every parameter in place. The name sets must match exactly.
    fn load_parameters(
        &self,
        tensors: HashMap<String, Tensor>,
    ) -> std::result::Result<(), LoadError> {
        assign_parameters(&self.parameters(), tensors)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("missing parameters: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("unexpected parameters: {}", .0.join(", "))]
    Unexpected(Vec<String>),

    #[error("shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Validates the whole mapping before mutating any parameter.
pub fn assign_parameters(
    parameters: &[(String, Var)],
    mut tensors: HashMap<String, Tensor>,
) -> std::result::Result<(), LoadError> {
    let missing: Vec<String> = parameters
        .iter()
        .filter(|(name, _)| !tensors.contains_key(name))
        .map(|(name, _)| name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(LoadError::Missing(missing));
    }

    if tensors.len() != parameters.len() {
        let known: Vec<&str> = parameters.iter().map(|(name, _)| name.as_str()).collect();
        let mut unexpected: Vec<String> = tensors
            .keys()
            .filter(|name| !known.contains(&name.as_str()))
            .cloned()
            .collect();
        unexpected.sort();
        return Err(LoadError::Unexpected(unexpected));
    }

    for (name, var) in parameters {
        if let Some(tensor) = tensors.get(name) {
            if tensor.dims() != var.dims() {
                return Err(LoadError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    found: tensor.dims().to_vec(),
                });
            }
        }
    }

    for (name, var) in parameters {
        let Some(tensor) = tensors.remove(name) else {
            continue;
        };
        let tensor = if tensor.dtype() == var.dtype() {
            tensor
        } else {
            tensor.to_dtype(var.dtype())?
        };
        var.set(&tensor.to_device(var.device())?)?;
    }

    Ok(())
}
