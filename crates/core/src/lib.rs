//! Real-ESRGAN image upscaling with a deterministic Lanczos fallback.

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod esrgan;
pub mod logging;
pub mod resample;
pub mod runtime;
pub mod server;
pub mod types;
pub mod weights;

pub use dispatch::{EsrganUpscaler, UpscaledPng, Upscaler};
pub use error::UpscaleError;
pub use types::{ModelChoice, ScaleFactor, UpscaleOptions, UpscalePath, Upscaled};
