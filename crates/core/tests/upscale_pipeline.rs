use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use tokio_util::sync::CancellationToken;
use upscaler_core::backend::Device;
use upscaler_core::cache::ModelLoader;
use upscaler_core::config::{config_path, initialize_data_dir, AppConfig};
use upscaler_core::esrgan::SuperResolve;
use upscaler_core::{
    EsrganUpscaler, ModelChoice, ScaleFactor, UpscaleError, UpscaleOptions, UpscalePath, Upscaler,
};

fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 13 % 256) as u8, (y * 29 % 256) as u8, ((x + y) * 7 % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Answers every request with 404 until the test process exits.
fn spawn_not_found_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_thread = Arc::clone(&hits);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            hits_for_thread.fetch_add(1, Ordering::SeqCst);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let mut buffer = [0u8; 4096];
            let _ = stream.read(&mut buffer);
            let _ = stream.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    });

    (format!("http://{addr}"), hits)
}

fn offline_config(base_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.weights.base_url = Some(base_url.to_string());
    config.weights.max_attempts = 1;
    config.weights.connect_timeout_secs = 2;
    config
}

fn list_dir(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn model_path_failure_falls_back_without_leaving_files() {
    let (base_url, _hits) = spawn_not_found_server();
    let data_dir = tempfile::tempdir().unwrap();
    let config = offline_config(&base_url);
    let upscaler =
        EsrganUpscaler::from_config(&config, data_dir.path(), CancellationToken::new()).unwrap();

    let options = UpscaleOptions {
        scale: ScaleFactor::X4,
        model_choice: ModelChoice::Model,
        use_gpu: false,
        preserve_aspect: true,
    };
    let out = upscaler.upscale(&gradient_png(8, 6), &options).unwrap();

    assert_eq!(out.path, UpscalePath::Fallback);
    assert_eq!(out.image.dimensions(), (32, 24));
    assert!(out.fallback_reason.is_some());
    let lanczos = upscaler_core::resample::resample(&gradient_png(8, 6), 4, true).unwrap();
    assert_eq!(out.image, lanczos);
    assert!(!upscaler.cache().is_loaded(ScaleFactor::X4));
    assert!(list_dir(&config.weights_dir(data_dir.path())).is_empty());
}

#[test]
fn weight_fetch_404_is_reported_and_backed_off() {
    let (base_url, hits) = spawn_not_found_server();
    let data_dir = tempfile::tempdir().unwrap();
    let config = offline_config(&base_url);
    let upscaler =
        EsrganUpscaler::from_config(&config, data_dir.path(), CancellationToken::new()).unwrap();
    let provisioner = upscaler.provisioner();

    let err = provisioner.ensure_weights(ScaleFactor::X2).unwrap_err();
    assert!(matches!(err, UpscaleError::Fetch { scale: 2, .. }), "{err}");
    assert!(err.to_string().contains("HTTP 404"), "{err}");
    assert!(err.is_recoverable());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let again = provisioner.ensure_weights(ScaleFactor::X2).unwrap_err();
    assert!(again.to_string().contains("next attempt"), "{again}");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(provisioner.fetch_count(), 1);
    assert!(list_dir(&config.weights_dir(data_dir.path())).is_empty());
}

#[test]
fn fallback_choice_doubles_a_100px_image() {
    let data_dir = tempfile::tempdir().unwrap();
    let upscaler = EsrganUpscaler::from_config(
        &AppConfig::default(),
        data_dir.path(),
        CancellationToken::new(),
    )
    .unwrap();
    let options = UpscaleOptions {
        scale: ScaleFactor::X2,
        model_choice: ModelChoice::Fallback,
        use_gpu: false,
        preserve_aspect: true,
    };

    let out = upscaler.upscale_to_png(&gradient_png(100, 100), &options).unwrap();

    assert_eq!(out.path, UpscalePath::Fallback);
    assert!(out.fallback_reason.is_none());
    assert_eq!(out.filename, "upscaled_x2.png");
    let decoded = image::load_from_memory_with_format(&out.bytes, ImageFormat::Png).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (200, 200));
}

#[test]
fn fallback_output_is_deterministic() {
    let (base_url, _hits) = spawn_not_found_server();
    let data_dir = tempfile::tempdir().unwrap();
    let upscaler = EsrganUpscaler::from_config(
        &offline_config(&base_url),
        data_dir.path(),
        CancellationToken::new(),
    )
    .unwrap();
    let png = gradient_png(17, 9);

    let forced = UpscaleOptions {
        scale: ScaleFactor::X2,
        model_choice: ModelChoice::Fallback,
        use_gpu: false,
        preserve_aspect: true,
    };
    let degraded = UpscaleOptions {
        model_choice: ModelChoice::Auto,
        ..forced
    };

    let first = upscaler.upscale_to_png(&png, &forced).unwrap();
    let second = upscaler.upscale_to_png(&png, &forced).unwrap();
    let third = upscaler.upscale_to_png(&png, &degraded).unwrap();

    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.bytes, third.bytes);
    assert_eq!(third.path, UpscalePath::Fallback);
    assert_eq!(first.filename, "upscaled_x2.png");
}

#[test]
fn decode_errors_surface_through_every_choice() {
    let (base_url, hits) = spawn_not_found_server();
    let data_dir = tempfile::tempdir().unwrap();
    let upscaler = EsrganUpscaler::from_config(
        &offline_config(&base_url),
        data_dir.path(),
        CancellationToken::new(),
    )
    .unwrap();

    for model_choice in [ModelChoice::Auto, ModelChoice::Model, ModelChoice::Fallback] {
        let options = UpscaleOptions {
            model_choice,
            ..UpscaleOptions::default()
        };
        let err = upscaler.upscale(b"GIF89a....", &options).unwrap_err();
        assert!(matches!(err, UpscaleError::Decode(_)), "{err}");
        assert!(!err.is_recoverable());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn config_file_drives_weights_location() {
    let data_dir = tempfile::tempdir().unwrap();
    initialize_data_dir(data_dir.path()).unwrap();
    std::fs::write(
        config_path(data_dir.path()),
        "[paths]\nweights_dir = \"models/esrgan\"\n\n[weights]\nbase_url = \"http://127.0.0.1:9/mirror/\"\n",
    )
    .unwrap();

    let config = AppConfig::load_from_path(&config_path(data_dir.path())).unwrap();
    let upscaler =
        EsrganUpscaler::from_config(&config, data_dir.path(), CancellationToken::new()).unwrap();
    let provisioner = upscaler.provisioner();

    assert_eq!(
        provisioner.weight_path(ScaleFactor::X8),
        data_dir.path().join("models/esrgan/RealESRGAN_x8.onnx")
    );
    assert_eq!(
        provisioner.weight_url(ScaleFactor::X8).unwrap().as_str(),
        "http://127.0.0.1:9/mirror/RealESRGAN_x8.onnx"
    );
}

#[test]
fn invalid_base_url_is_rejected_at_construction() {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.weights.base_url = Some("not a url".to_string());

    let err = EsrganUpscaler::from_config(&config, data_dir.path(), CancellationToken::new())
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("weights.base_url"));
}

struct SlowNearest {
    scale: ScaleFactor,
}

impl SuperResolve for SlowNearest {
    fn scale(&self) -> ScaleFactor {
        self.scale
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn infer(&self, image: &RgbImage) -> Result<RgbImage, UpscaleError> {
        let factor = self.scale.factor();
        Ok(imageops::resize(
            image,
            image.width() * factor,
            image.height() * factor,
            FilterType::Nearest,
        ))
    }
}

struct CountingLoader {
    loads: AtomicUsize,
}

impl ModelLoader for CountingLoader {
    type Model = SlowNearest;

    fn load(&self, scale: ScaleFactor, _use_gpu: bool) -> Result<SlowNearest, UpscaleError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        Ok(SlowNearest { scale })
    }
}

#[test]
fn concurrent_requests_share_one_model_per_scale() {
    let upscaler = Upscaler::new(CountingLoader {
        loads: AtomicUsize::new(0),
    });
    let png = Arc::new(gradient_png(6, 4));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let upscaler = upscaler.clone();
            let png = Arc::clone(&png);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let scale = if i % 2 == 0 { ScaleFactor::X2 } else { ScaleFactor::X4 };
                let options = UpscaleOptions {
                    scale,
                    ..UpscaleOptions::default()
                };
                barrier.wait();
                upscaler.upscale(&png, &options).unwrap()
            })
        })
        .collect();

    for handle in handles {
        let out = handle.join().unwrap();
        assert_eq!(out.path, UpscalePath::Model);
        let factor = out.scale.factor();
        assert_eq!(out.image.dimensions(), (6 * factor, 4 * factor));
    }

    assert_eq!(upscaler.cache().loader().loads.load(Ordering::SeqCst), 2);
    let mut cached = upscaler.cache().cached_scales();
    cached.sort();
    assert_eq!(cached, vec![ScaleFactor::X2, ScaleFactor::X4]);
}
