//! Inference backend: device selection and `ort::Session` construction.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Compute placement of a loaded model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

impl Device {
    pub fn is_accelerator(self) -> bool {
        matches!(self, Self::Cuda)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => bail!("unknown device '{other}' (expected cpu or cuda)"),
        }
    }
}

/// Pick the accelerator when requested and the CUDA execution provider loads.
pub fn select_device(use_gpu: bool) -> Device {
    choose_device(use_gpu, || {
        CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    })
}

fn choose_device(use_gpu: bool, cuda_available: impl FnOnce() -> bool) -> Device {
    if !use_gpu {
        return Device::Cpu;
    }
    if cuda_available() {
        Device::Cuda
    } else {
        warn!("CUDA EP is not available; placing model on CPU");
        Device::Cpu
    }
}

/// Build an `ort::Session` for `model_path` on `device`.
///
/// `Device::Cuda` registers the CUDA EP with `error_on_failure`, so a broken
/// CUDA install surfaces as an error instead of a silent CPU session.
pub fn build_session(model_path: &Path, device: Device) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    debug!(model = %model_path.display(), %device, "Building ONNX session");

    let session = match device {
        Device::Cuda => builder
            .with_execution_providers([CUDAExecutionProvider::default()
                .build()
                .error_on_failure()])?
            .commit_from_file(model_path),
        Device::Cpu => builder.commit_from_file(model_path),
    }
    .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    Ok(session)
}

/// One inference slot per device.
#[derive(Debug, Default)]
pub struct DeviceGates {
    cpu: Mutex<()>,
    cuda: Mutex<()>,
}

impl DeviceGates {
    pub fn gate(&self, device: Device) -> &Mutex<()> {
        match device {
            Device::Cpu => &self.cpu,
            Device::Cuda => &self.cuda,
        }
    }
}
