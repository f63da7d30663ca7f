//! Error taxonomy shared by both upscale paths.

use thiserror::Error;

/// Errors surfaced by the resampler, weight provisioner, model cache and dispatcher.
///
/// Only model-path failures are recoverable: the dispatcher degrades to the
/// deterministic resampler for those and propagates everything else.
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("invalid scale factor {scale} for {width}x{height} image")]
    InvalidScale { scale: u32, width: u32, height: u32 },

    #[error("super-resolution backend unavailable: {0}")]
    UnavailableDependency(String),

    #[error("failed to fetch weights for x{scale}: {reason}")]
    Fetch { scale: u32, reason: String },

    #[error("super-resolution inference failed: {0}")]
    Inference(String),

    #[error("failed to encode PNG: {0}")]
    Encode(String),
}

impl UpscaleError {
    /// Whether the dispatcher may fall back to resampling after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnavailableDependency(_) | Self::Fetch { .. } | Self::Inference(_)
        )
    }

    pub fn fetch(scale: u32, error: &anyhow::Error) -> Self {
        Self::Fetch {
            scale,
            reason: format!("{error:#}"),
        }
    }

    pub fn inference(error: &anyhow::Error) -> Self {
        Self::Inference(format!("{error:#}"))
    }

    /// Short machine-readable name, used in logs and response headers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::InvalidScale { .. } => "invalid_scale",
            Self::UnavailableDependency(_) => "unavailable_dependency",
            Self::Fetch { .. } => "fetch",
            Self::Inference(_) => "inference",
            Self::Encode(_) => "encode",
        }
    }
}
