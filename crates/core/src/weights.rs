//! Weight provisioning: make sure `RealESRGAN_x{scale}.onnx` exists locally.
//!
//! Downloads stream into a `.part` file next to the destination and are
//! renamed into place only after the body was fully written, fsynced and
//! (optionally) checksum-verified. A present file is trusted as-is.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::UpscaleError;
use crate::logging::REDACTION_PLACEHOLDER;
use crate::types::ScaleFactor;

pub const WEIGHT_FILE_EXTENSION: &str = "onnx";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(60);
const RETRY_BACKOFF_MS: u64 = 250;
const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// File name of the weight export for `scale`.
pub fn weight_file_name(scale: ScaleFactor) -> String {
    format!("RealESRGAN_x{}.{WEIGHT_FILE_EXTENSION}", scale.factor())
}

#[derive(Debug, Clone)]
pub struct WeightSettings {
    /// Host serving `RealESRGAN_x{scale}.onnx`. Without one, missing weights
    /// are reported as an unavailable dependency and nothing is fetched.
    pub base_url: Option<Url>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_attempts: usize,
    /// After a failed download, further attempts for that scale fail fast
    /// until this much time has passed.
    pub failure_backoff: Duration,
    /// Expected lowercase hex SHA-256 per scale. Scales without an entry are not verified.
    pub checksums: HashMap<ScaleFactor, String>,
}

impl WeightSettings {
    pub fn with_base_url(base_url: Url) -> Self {
        Self {
            base_url: Some(base_url),
            ..Self::default()
        }
    }
}

impl Default for WeightSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            checksums: HashMap::new(),
        }
    }
}

pub struct WeightProvisioner {
    weights_dir: PathBuf,
    settings: WeightSettings,
    cancel: CancellationToken,
    scale_locks: DashMap<ScaleFactor, Arc<Mutex<()>>>,
    last_failure: DashMap<ScaleFactor, Instant>,
    fetches: AtomicUsize,
}

impl WeightProvisioner {
    pub fn new(weights_dir: impl Into<PathBuf>, settings: WeightSettings) -> Self {
        Self {
            weights_dir: weights_dir.into(),
            settings,
            cancel: CancellationToken::new(),
            scale_locks: DashMap::new(),
            last_failure: DashMap::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Abort in-flight and future downloads once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    pub fn weight_path(&self, scale: ScaleFactor) -> PathBuf {
        self.weights_dir.join(weight_file_name(scale))
    }

    pub fn weight_url(&self, scale: ScaleFactor) -> Result<Url> {
        let base_url = self
            .settings
            .base_url
            .as_ref()
            .context("no weights base_url is configured")?;
        let base = base_url.as_str().trim_end_matches('/');
        let raw = format!("{base}/{}", weight_file_name(scale));
        Url::parse(&raw).with_context(|| format!("invalid weight URL: {raw}"))
    }

    pub fn is_present(&self, scale: ScaleFactor) -> bool {
        self.weight_path(scale).is_file()
    }

    /// Number of HTTP requests started by this provisioner.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Return the local weight path for `scale`, downloading it first if absent.
    pub fn ensure_weights(&self, scale: ScaleFactor) -> Result<PathBuf, UpscaleError> {
        let final_path = self.weight_path(scale);
        if final_path.is_file() {
            debug!(path = %final_path.display(), %scale, "Weight file already present");
            return Ok(final_path);
        }

        let slot = self.scale_locks.entry(scale).or_default().clone();
        let _guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another caller may have finished the download while we waited.
        if final_path.is_file() {
            return Ok(final_path);
        }

        if self.settings.base_url.is_none() {
            return Err(UpscaleError::UnavailableDependency(format!(
                "{} is missing and no [weights] base_url is configured",
                final_path.display()
            )));
        }

        if let Some(remaining) = self.backoff_remaining(scale) {
            return Err(UpscaleError::Fetch {
                scale: scale.factor(),
                reason: format!(
                    "previous download failed; next attempt in {}s",
                    remaining.as_secs().max(1)
                ),
            });
        }

        match self.download(scale, &final_path) {
            Ok(()) => {
                self.last_failure.remove(&scale);
                Ok(final_path)
            }
            Err(error) => {
                if !self.cancel.is_cancelled() {
                    self.last_failure.insert(scale, Instant::now());
                }
                Err(UpscaleError::fetch(scale.factor(), &error))
            }
        }
    }

    fn backoff_remaining(&self, scale: ScaleFactor) -> Option<Duration> {
        let failed_at = *self.last_failure.get(&scale)?;
        self.settings
            .failure_backoff
            .checked_sub(failed_at.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    fn download(&self, scale: ScaleFactor, final_path: &Path) -> Result<()> {
        let url = self.weight_url(scale)?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => bail!("unsupported weight URL scheme '{scheme}' (expected http/https)"),
        }
        let redacted = redacted_url_for_display(&url);
        let expected_sha = self.settings.checksums.get(&scale).map(String::as_str);

        if let Some(parent_dir) = final_path.parent() {
            fs::create_dir_all(parent_dir).with_context(|| {
                format!("failed to create weights dir: {}", parent_dir.display())
            })?;
        }

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.request_timeout)
            .build()
            .context("failed to build HTTP client for weight download")?;

        info!(url = %redacted, path = %final_path.display(), %scale, "Downloading weights");

        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                bail!("download of {redacted} cancelled");
            }

            match self.download_once(&client, &url, &redacted, final_path, expected_sha) {
                Ok(bytes) => {
                    info!(path = %final_path.display(), bytes, %scale, "Weights downloaded");
                    return Ok(());
                }
                Err(DownloadAttemptError { retryable, error }) => {
                    if retryable && attempt < max_attempts {
                        debug!(
                            url = %redacted,
                            attempt,
                            max_attempts,
                            error = %error,
                            "weight download attempt failed; retrying"
                        );
                        let backoff_ms = RETRY_BACKOFF_MS.saturating_mul(attempt as u64);
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                        continue;
                    }

                    if retryable {
                        return Err(anyhow!(
                            "download failed after {max_attempts} attempts for {redacted}: {error:#}"
                        ));
                    }
                    return Err(error);
                }
            }
        }

        Err(anyhow!(
            "download failed after {max_attempts} attempts for {redacted}"
        ))
    }

    fn download_once(
        &self,
        client: &reqwest::blocking::Client,
        url: &Url,
        redacted_url: &str,
        final_path: &Path,
        expected_sha: Option<&str>,
    ) -> std::result::Result<u64, DownloadAttemptError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let mut response = client.get(url.as_str()).send().map_err(|err| {
            let wrapped = anyhow!("failed to start download from {redacted_url}");
            if is_retryable_reqwest_error(&err) {
                DownloadAttemptError::retryable(wrapped)
            } else {
                DownloadAttemptError::fatal(wrapped)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let wrapped = anyhow!(
                "download request returned HTTP {} for {}",
                status.as_u16(),
                redacted_url
            );
            if is_retryable_status(status) {
                return Err(DownloadAttemptError::retryable(wrapped));
            }
            return Err(DownloadAttemptError::fatal(wrapped));
        }

        let tmp_path = part_path(final_path);
        cleanup_file_if_exists(&tmp_path);

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))
            .map_err(DownloadAttemptError::fatal)?;
        let mut tmp_guard = TempFileCleanupGuard::new(&tmp_path);

        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(DownloadAttemptError::fatal(anyhow!(
                    "download of {redacted_url} cancelled"
                )));
            }

            let read = match response.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(DownloadAttemptError::retryable(anyhow!(
                        "failed while reading HTTP body from {redacted_url}: {err}"
                    )));
                }
            };

            hasher.update(&chunk[..read]);
            tmp_file
                .write_all(&chunk[..read])
                .with_context(|| format!("failed to write temp file: {}", tmp_path.display()))
                .map_err(DownloadAttemptError::fatal)?;
            written += read as u64;
        }

        if let Some(expected) = expected_sha {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(DownloadAttemptError::fatal(anyhow!(
                    "checksum mismatch for {redacted_url}: expected {expected}, got {actual}"
                )));
            }
        }

        tmp_file
            .flush()
            .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
            .map_err(DownloadAttemptError::fatal)?;
        tmp_file
            .sync_all()
            .with_context(|| format!("failed to fsync temp file: {}", tmp_path.display()))
            .map_err(DownloadAttemptError::fatal)?;
        drop(tmp_file);

        fs::rename(&tmp_path, final_path)
            .with_context(|| {
                format!(
                    "failed to atomically move {} -> {}",
                    tmp_path.display(),
                    final_path.display()
                )
            })
            .map_err(DownloadAttemptError::fatal)?;

        tmp_guard.disarm();
        Ok(written)
    }
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

struct DownloadAttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl DownloadAttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            cleanup_file_if_exists(self.path);
        }
    }
}

fn cleanup_file_if_exists(path: &Path) {
    let _ = fs::remove_file(path);
}

pub(crate) fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_password(None);
    redacted.set_fragment(None);
    if redacted.query().is_some() {
        redacted.set_query(None);
        return format!("{redacted}?{REDACTION_PLACEHOLDER}");
    }
    redacted.to_string()
}
