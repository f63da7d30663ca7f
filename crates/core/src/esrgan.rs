//! Real-ESRGAN (RRDBNet) super-resolution through `ort::Session`.
//!
//! The exported graph takes one `[1, 3, H, W]` tensor and returns
//! `[1, 3, H * scale, W * scale]`. Inputs are reflection padded on the
//! bottom/right edge before the run and the padding is cropped from the output.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, ensure, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use image::RgbImage;
use ndarray::{s, Array4, ArrayD, Ix4};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{build_session, select_device, Device, DeviceGates};
use crate::cache::ModelLoader;
use crate::error::UpscaleError;
use crate::runtime;
use crate::types::ScaleFactor;
use crate::weights::WeightProvisioner;

/// Output of the network must be cropped from a size aligned to this.
pub const PAD_ALIGN: usize = 4;
pub const DEFAULT_PRE_PAD: usize = 10;
const TILE_OVERLAP: usize = 10;

/// Pixel range the exported graph was trained on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueRange {
    /// 0.0..=1.0
    #[default]
    Unit,
    /// 0.0..=255.0
    Byte,
}

impl ValueRange {
    fn max(self) -> f32 {
        match self {
            Self::Unit => 1.0,
            Self::Byte => 255.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceConfig {
    /// Tile edge in input pixels; 0 runs the whole image in one pass.
    pub tile: usize,
    pub pre_pad: usize,
    pub pad_align: usize,
    /// Accept float16 exports. Only set on an accelerator; float32 exports
    /// always run in float32.
    pub half: bool,
    pub value_range: ValueRange,
}

impl InferenceConfig {
    pub fn for_device(device: Device, settings: &InferenceSettings) -> Self {
        Self {
            tile: settings.tile,
            pre_pad: settings.pre_pad,
            pad_align: PAD_ALIGN,
            half: device.is_accelerator(),
            value_range: settings.value_range,
        }
    }
}

/// Loader-wide knobs that do not depend on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceSettings {
    pub tile: usize,
    pub pre_pad: usize,
    pub value_range: ValueRange,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            tile: 0,
            pre_pad: DEFAULT_PRE_PAD,
            value_range: ValueRange::default(),
        }
    }
}

/// Anything that turns an image into one `scale` times larger.
pub trait SuperResolve: Send + Sync {
    fn scale(&self) -> ScaleFactor;
    fn device(&self) -> Device;
    fn infer(&self, image: &RgbImage) -> Result<RgbImage, UpscaleError>;
}

pub struct EsrganModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16_model: bool,
    scale: ScaleFactor,
    device: Device,
    config: InferenceConfig,
    gates: Arc<DeviceGates>,
}

impl EsrganModel {
    pub fn from_file(
        model_path: &Path,
        scale: ScaleFactor,
        device: Device,
        config: InferenceConfig,
        gates: Arc<DeviceGates>,
    ) -> Result<Self> {
        let session = build_session(model_path, device)?;
        let (input_name, output_name, is_fp16_model) = inspect_io(&session)
            .with_context(|| format!("{} is not an RRDBNet export", model_path.display()))?;

        debug!(%input_name, %output_name, is_fp16_model, %device, "Detected model IO");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16_model,
            scale,
            device,
            config,
            gates,
        })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    fn forward(&self, input: Array4<f32>) -> Result<Array4<f32>> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        check_precision(self.is_fp16_model, &self.config, self.device)?;

        let output = if self.is_fp16_model {
            let input_tensor = Tensor::from_array(nchw_to_f16(&input)?)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            f16_to_nchw(&output_view.to_owned())?
        } else {
            let input_tensor = Tensor::from_array(input)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            output_view.to_owned().into_dimensionality::<Ix4>()?
        };

        Ok(output)
    }
}

impl SuperResolve for EsrganModel {
    fn scale(&self) -> ScaleFactor {
        self.scale
    }

    fn device(&self) -> Device {
        self.device
    }

    fn infer(&self, image: &RgbImage) -> Result<RgbImage, UpscaleError> {
        let _gate = self
            .gates
            .gate(self.device)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        upscale_rgb(image, self.scale.factor() as usize, &self.config, |input| {
            self.forward(input)
        })
        .map_err(|e| UpscaleError::inference(&e))
    }
}

/// Check the single-input, 3-channel NCHW contract and return
/// `(input_name, output_name, is_fp16)`.
fn inspect_io(session: &Session) -> Result<(String, String, bool)> {
    let inputs = session.inputs();
    let outputs = session.outputs();
    ensure!(inputs.len() == 1, "expected 1 input, found {}", inputs.len());
    ensure!(!outputs.is_empty(), "graph has no outputs");

    let is_fp16 = match inputs[0].dtype() {
        ValueType::Tensor { ty, shape, .. } => {
            check_nchw_rgb("input", shape)?;
            match *ty {
                TensorElementType::Float16 => true,
                TensorElementType::Float32 => false,
                other => bail!("unsupported input element type {other:?}"),
            }
        }
        other => bail!("input is not a tensor: {other:?}"),
    };

    if let ValueType::Tensor { shape, .. } = outputs[0].dtype() {
        check_nchw_rgb("output", shape)?;
    } else {
        bail!("output is not a tensor");
    }

    Ok((
        inputs[0].name().to_string(),
        outputs[0].name().to_string(),
        is_fp16,
    ))
}

/// A float16 export needs `half`; float32 exports run anywhere.
fn check_precision(is_fp16_model: bool, config: &InferenceConfig, device: Device) -> Result<()> {
    ensure!(
        !is_fp16_model || config.half,
        "model expects float16 input but half precision is disabled on {device}"
    );
    Ok(())
}

fn check_nchw_rgb(which: &str, shape: &[i64]) -> Result<()> {
    ensure!(shape.len() == 4, "{which} rank is {}, expected 4 (NCHW)", shape.len());
    let channels = shape[1];
    ensure!(
        channels == 3 || channels < 0,
        "{which} has {channels} channels, expected 3"
    );
    Ok(())
}

/// Upscale an RGB image with `forward` doing the network run on padded NCHW input.
fn upscale_rgb<F>(
    image: &RgbImage,
    scale: usize,
    config: &InferenceConfig,
    mut forward: F,
) -> Result<RgbImage>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>>,
{
    let input = rgb_to_nchw(image, config.value_range);
    let (h, w) = (input.shape()[2], input.shape()[3]);

    let output = if config.tile == 0 || (h <= config.tile && w <= config.tile) {
        upscale_padded(&input, scale, config, &mut forward)?
    } else {
        upscale_tiled(&input, scale, config, &mut forward)?
    };

    nchw_to_rgb(&output, config.value_range)
}

fn upscale_padded<F>(
    input: &Array4<f32>,
    scale: usize,
    config: &InferenceConfig,
    forward: &mut F,
) -> Result<Array4<f32>>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>>,
{
    let (h, w) = (input.shape()[2], input.shape()[3]);
    let pad_h = config.pre_pad + pad_amount(h + config.pre_pad, config.pad_align);
    let pad_w = config.pre_pad + pad_amount(w + config.pre_pad, config.pad_align);
    let padded = reflect_pad(input, pad_h, pad_w);
    let (padded_h, padded_w) = (padded.shape()[2], padded.shape()[3]);

    let output = forward(padded)?;
    let (out_h, out_w) = (output.shape()[2], output.shape()[3]);
    if output.shape()[..2] != [1, 3] || out_h != padded_h * scale || out_w != padded_w * scale {
        bail!(
            "model returned {:?} for a {padded_h}x{padded_w} input; expected x{scale} upscale",
            output.shape()
        );
    }

    Ok(output
        .slice(s![.., .., ..h * scale, ..w * scale])
        .to_owned())
}

/// Run the network on overlapping tiles and stitch the centres together.
fn upscale_tiled<F>(
    input: &Array4<f32>,
    scale: usize,
    config: &InferenceConfig,
    forward: &mut F,
) -> Result<Array4<f32>>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>>,
{
    let (h, w) = (input.shape()[2], input.shape()[3]);
    let tile = config.tile;
    let mut output = Array4::<f32>::zeros((1, 3, h * scale, w * scale));

    debug!(tile, overlap = TILE_OVERLAP, h, w, "Starting tiled inference");

    for y0 in (0..h).step_by(tile) {
        for x0 in (0..w).step_by(tile) {
            let y1 = (y0 + tile).min(h);
            let x1 = (x0 + tile).min(w);
            let in_y0 = y0.saturating_sub(TILE_OVERLAP);
            let in_x0 = x0.saturating_sub(TILE_OVERLAP);
            let in_y1 = (y1 + TILE_OVERLAP).min(h);
            let in_x1 = (x1 + TILE_OVERLAP).min(w);

            let patch = input
                .slice(s![.., .., in_y0..in_y1, in_x0..in_x1])
                .to_owned();
            let upscaled = upscale_padded(&patch, scale, config, forward)?;

            let off_y = (y0 - in_y0) * scale;
            let off_x = (x0 - in_x0) * scale;
            output
                .slice_mut(s![.., .., y0 * scale..y1 * scale, x0 * scale..x1 * scale])
                .assign(&upscaled.slice(s![
                    ..,
                    ..,
                    off_y..off_y + (y1 - y0) * scale,
                    off_x..off_x + (x1 - x0) * scale
                ]));
        }
    }

    Ok(output)
}

fn pad_amount(dim: usize, align: usize) -> usize {
    if align <= 1 {
        return 0;
    }
    (align - (dim % align)) % align
}

/// Reflect `i` back into `0..n` without repeating the edge pixel
/// (`n = 4`: 0 1 2 3 2 1 0 1 ...).
fn mirror_index(i: usize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i % period;
    if m < n {
        m
    } else {
        period - m
    }
}

/// Reflection-pad an NCHW array on the bottom and right edges.
fn reflect_pad(arr: &Array4<f32>, pad_h: usize, pad_w: usize) -> Array4<f32> {
    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }
    let (c, h, w) = (arr.shape()[1], arr.shape()[2], arr.shape()[3]);
    Array4::from_shape_fn((1, c, h + pad_h, w + pad_w), |(n, ch, y, x)| {
        arr[[n, ch, mirror_index(y, h), mirror_index(x, w)]]
    })
}

/// Interleaved RGB → `[1, 3, H, W]` float in `range`.
fn rgb_to_nchw(image: &RgbImage, range: ValueRange) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let norm = range.max() / 255.0;
    let raw = image.as_raw();
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        raw[(y * w + x) * 3 + c] as f32 * norm
    })
}

/// `[1, 3, H, W]` float in `range` → interleaved RGB, clamped and rounded.
fn nchw_to_rgb(arr: &Array4<f32>, range: ValueRange) -> Result<RgbImage> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    let denorm = 255.0 / range.max();
    let mut rgb = vec![0u8; h * w * 3];
    for ((_, c, y, x), value) in arr.indexed_iter() {
        rgb[(y * w + x) * 3 + c] = (value * denorm).round().clamp(0.0, 255.0) as u8;
    }
    RgbImage::from_raw(w as u32, h as u32, rgb).context("output buffer size mismatch")
}

fn nchw_to_f16(arr: &Array4<f32>) -> Result<ArrayD<f16>> {
    let standard = arr.as_standard_layout();
    let f32_slice = standard
        .as_slice()
        .context("input must be contiguous for f16 conversion")?;
    let mut fp16 = vec![f16::ZERO; f32_slice.len()];
    fp16.convert_from_f32_slice(f32_slice);
    Ok(ArrayD::from_shape_vec(arr.shape().to_vec(), fp16)?)
}

fn f16_to_nchw(arr: &ArrayD<f16>) -> Result<Array4<f32>> {
    let standard = arr.as_standard_layout();
    let fp16_slice = standard
        .as_slice()
        .context("output must be contiguous for f32 conversion")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);
    Ok(ArrayD::from_shape_vec(arr.shape().to_vec(), f32_data)?.into_dimensionality::<Ix4>()?)
}

/// Production [`ModelLoader`]: provision weights, pick a device, build the session.
pub struct EsrganLoader {
    provisioner: Arc<WeightProvisioner>,
    settings: InferenceSettings,
    gates: Arc<DeviceGates>,
}

impl EsrganLoader {
    pub fn new(provisioner: Arc<WeightProvisioner>, settings: InferenceSettings) -> Self {
        Self {
            provisioner,
            settings,
            gates: Arc::new(DeviceGates::default()),
        }
    }

    pub fn provisioner(&self) -> &WeightProvisioner {
        &self.provisioner
    }
}

impl ModelLoader for EsrganLoader {
    type Model = EsrganModel;

    fn load(&self, scale: ScaleFactor, use_gpu: bool) -> Result<EsrganModel, UpscaleError> {
        runtime::init_onnxruntime().map_err(UpscaleError::UnavailableDependency)?;

        let weights = self.provisioner.ensure_weights(scale)?;
        let device = select_device(use_gpu);
        let config = InferenceConfig::for_device(device, &self.settings);

        info!(
            %scale,
            %device,
            weights = %weights.display(),
            half = config.half,
            "Building Real-ESRGAN session"
        );

        EsrganModel::from_file(&weights, scale, device, config, Arc::clone(&self.gates))
            .map_err(|e| UpscaleError::inference(&e))
    }
}
