use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Upscale factor with a published Real-ESRGAN weight file.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub enum ScaleFactor {
    #[default]
    X2,
    X4,
    X8,
}

impl ScaleFactor {
    pub const ALL: [ScaleFactor; 3] = [ScaleFactor::X2, ScaleFactor::X4, ScaleFactor::X8];

    pub fn factor(self) -> u32 {
        match self {
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
        }
    }
}

impl TryFrom<u32> for ScaleFactor {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> anyhow::Result<Self> {
        match value {
            2 => Ok(Self::X2),
            4 => Ok(Self::X4),
            8 => Ok(Self::X8),
            other => bail!("unsupported scale factor {other} (expected 2, 4 or 8)"),
        }
    }
}

impl From<ScaleFactor> for u32 {
    fn from(value: ScaleFactor) -> Self {
        value.factor()
    }
}

impl FromStr for ScaleFactor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim().trim_start_matches(['x', 'X']);
        let value: u32 = trimmed
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid scale factor '{s}' (expected 2, 4 or 8)"))?;
        Self::try_from(value)
    }
}

impl fmt::Display for ScaleFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.factor())
    }
}

/// Which upscale path the caller asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelChoice {
    #[default]
    Auto,
    #[serde(alias = "realesrgan", alias = "esrgan")]
    Model,
    Fallback,
}

impl FromStr for ModelChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "model" | "realesrgan" | "esrgan" => Ok(Self::Model),
            "fallback" | "lanczos" => Ok(Self::Fallback),
            other => bail!("unknown model choice '{other}' (expected auto, model or fallback)"),
        }
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Model => write!(f, "model"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Caller-supplied settings for one upscale request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleOptions {
    pub scale: ScaleFactor,
    pub model_choice: ModelChoice,
    pub use_gpu: bool,
    pub preserve_aspect: bool,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            scale: ScaleFactor::X2,
            model_choice: ModelChoice::Auto,
            use_gpu: true,
            preserve_aspect: true,
        }
    }
}

/// Path that actually produced an [`Upscaled`] image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpscalePath {
    Model,
    Fallback,
}

impl fmt::Display for UpscalePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug)]
pub struct Upscaled {
    pub image: RgbImage,
    pub scale: ScaleFactor,
    pub path: UpscalePath,
    /// Set when the model path was attempted and failed.
    pub fallback_reason: Option<String>,
}

/// Download name for an upscaled result.
pub fn output_filename(scale: ScaleFactor) -> String {
    format!("upscaled_x{}.png", scale.factor())
}
