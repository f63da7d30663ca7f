//! Routes an upscale request to the Real-ESRGAN path or the Lanczos fallback.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{ModelCache, ModelLoader};
use crate::config::AppConfig;
use crate::esrgan::{EsrganLoader, SuperResolve};
use crate::error::UpscaleError;
use crate::resample::{decode_rgb, encode_png, resample, resample_image};
use crate::types::{output_filename, ModelChoice, UpscaleOptions, UpscalePath, Upscaled};
use crate::weights::WeightProvisioner;

/// Encoded result ready for download.
pub struct UpscaledPng {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub path: UpscalePath,
    pub fallback_reason: Option<String>,
}

pub type EsrganUpscaler = Upscaler<EsrganLoader>;

pub struct Upscaler<L: ModelLoader> {
    cache: Arc<ModelCache<L>>,
}

impl<L: ModelLoader> Clone for Upscaler<L> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<L> Upscaler<L>
where
    L: ModelLoader,
    L::Model: SuperResolve,
{
    pub fn new(loader: L) -> Self {
        Self::with_cache(Arc::new(ModelCache::new(loader)))
    }

    pub fn with_cache(cache: Arc<ModelCache<L>>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &ModelCache<L> {
        &self.cache
    }

    pub fn upscale(
        &self,
        image_bytes: &[u8],
        options: &UpscaleOptions,
    ) -> Result<Upscaled, UpscaleError> {
        let scale = options.scale;

        if options.model_choice == ModelChoice::Fallback {
            debug!(%scale, "Fallback requested; resampling");
            let image = resample(image_bytes, scale.factor(), options.preserve_aspect)?;
            return Ok(Upscaled {
                image,
                scale,
                path: UpscalePath::Fallback,
                fallback_reason: None,
            });
        }

        let decoded = decode_rgb(image_bytes)?;

        match self.run_model(&decoded, options) {
            Ok(image) => Ok(Upscaled {
                image,
                scale,
                path: UpscalePath::Model,
                fallback_reason: None,
            }),
            Err(error) if error.is_recoverable() => {
                warn!(
                    %scale,
                    kind = error.kind(),
                    error = %error,
                    "Super-resolution failed; falling back to Lanczos resampling"
                );
                let image = resample_image(&decoded, scale.factor())?;
                Ok(Upscaled {
                    image,
                    scale,
                    path: UpscalePath::Fallback,
                    fallback_reason: Some(error.to_string()),
                })
            }
            Err(error) => Err(error),
        }
    }

    /// [`Self::upscale`] followed by PNG encoding.
    pub fn upscale_to_png(
        &self,
        image_bytes: &[u8],
        options: &UpscaleOptions,
    ) -> Result<UpscaledPng, UpscaleError> {
        let upscaled = self.upscale(image_bytes, options)?;
        Ok(UpscaledPng {
            bytes: encode_png(&upscaled.image)?,
            filename: output_filename(upscaled.scale),
            path: upscaled.path,
            fallback_reason: upscaled.fallback_reason,
        })
    }

    fn run_model(&self, image: &RgbImage, options: &UpscaleOptions) -> Result<RgbImage, UpscaleError> {
        let model = self.cache.get_model(options.scale, options.use_gpu)?;
        debug!(
            scale = %options.scale,
            device = %model.device(),
            width = image.width(),
            height = image.height(),
            "Running super-resolution"
        );
        let output = model.infer(image)?;

        let expected = (
            image.width() * options.scale.factor(),
            image.height() * options.scale.factor(),
        );
        if output.dimensions() != expected {
            return Err(UpscaleError::Inference(format!(
                "model produced {}x{}, expected {}x{}",
                output.width(),
                output.height(),
                expected.0,
                expected.1
            )));
        }
        Ok(output)
    }
}

impl Upscaler<EsrganLoader> {
    /// Wire the production loader from the `[paths]`, `[weights]` and `[inference]` tables.
    pub fn from_config(
        config: &AppConfig,
        data_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let provisioner = WeightProvisioner::new(
            config.weights_dir(data_dir),
            config.weights.to_settings()?,
        )
        .with_cancellation(cancel);
        let loader = EsrganLoader::new(Arc::new(provisioner), config.inference.to_settings());
        Ok(Self::new(loader))
    }

    pub fn provisioner(&self) -> &WeightProvisioner {
        self.cache.loader().provisioner()
    }
}
