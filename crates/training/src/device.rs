use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Upper bound on CUDA ordinals probed when `max_devices` is not set.
pub const MAX_PROBED_ACCELERATORS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Metal, then CUDA, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Devices chosen for a run. Replicas receive shards of every batch.
#[derive(Debug, Clone)]
pub struct DevicePlan {
    pub primary: Device,
    pub replicas: Vec<Device>,
}

impl DevicePlan {
    pub fn cpu() -> Self {
        Self {
            primary: Device::Cpu,
            replicas: Vec::new(),
        }
    }

    pub fn device_count(&self) -> usize {
        1 + self.replicas.len()
    }

    fn from_devices(mut devices: Vec<Device>) -> Option<Self> {
        if devices.is_empty() {
            return None;
        }
        let primary = devices.remove(0);
        Some(Self {
            primary,
            replicas: devices,
        })
    }
}

pub fn select_devices(
    preference: DevicePreference,
    data_parallel: bool,
    max_devices: Option<usize>,
) -> Result<DevicePlan, TrainingError> {
    let limit = max_devices.unwrap_or(MAX_PROBED_ACCELERATORS).max(1);
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    log::info!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available,
        metal_available
    );

    let mut plan = match preference {
        DevicePreference::Cpu => DevicePlan::cpu(),
        DevicePreference::Metal => {
            let device = Device::new_metal(0).map_err(|err| {
                TrainingError::initialization(format!("metal device requested but unavailable: {err}"))
            })?;
            DevicePlan {
                primary: device,
                replicas: Vec::new(),
            }
        }
        DevicePreference::Cuda => DevicePlan::from_devices(probe_cuda(limit)).ok_or_else(|| {
            TrainingError::initialization("cuda device requested but none could be initialized")
        })?,
        DevicePreference::Auto => auto_select(metal_available, cuda_available, limit),
    };

    if !data_parallel && !plan.replicas.is_empty() {
        log::info!(
            "data parallelism disabled; ignoring {} additional device(s)",
            plan.replicas.len()
        );
        plan.replicas.clear();
    }

    log::info!(
        "device selected: is_cuda={} is_metal={} is_cpu={} replicas={}",
        plan.primary.is_cuda(),
        plan.primary.is_metal(),
        plan.primary.is_cpu(),
        plan.replicas.len()
    );
    Ok(plan)
}

fn auto_select(metal_available: bool, cuda_available: bool, limit: usize) -> DevicePlan {
    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                return DevicePlan {
                    primary: device,
                    replicas: Vec::new(),
                }
            }
            Err(err) => log::warn!("failed to initialize metal device, trying next backend: {err}"),
        }
    }
    if cuda_available {
        if let Some(plan) = DevicePlan::from_devices(probe_cuda(limit)) {
            return plan;
        }
        log::warn!("cuda reported available but initialization failed");
    }
    log::info!("no GPU backend available; using CPU");
    DevicePlan::cpu()
}

/// Opens consecutive CUDA ordinals until one fails or `limit` is reached.
fn probe_cuda(limit: usize) -> Vec<Device> {
    let mut devices = Vec::new();
    for ordinal in 0..limit {
        match Device::new_cuda(ordinal) {
            Ok(device) => devices.push(device),
            Err(_) => break,
        }
    }
    devices
}
