use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::esrgan::{InferenceSettings, ValueRange, DEFAULT_PRE_PAD};
use crate::types::ScaleFactor;
use crate::weights::{
    WeightSettings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_FAILURE_BACKOFF, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_REQUEST_TIMEOUT,
};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPSCALER_DATA_DIR";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub weights: WeightsConfig,
    pub inference: InferenceOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Relative paths resolve against the data directory.
    pub weights_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WeightsConfig {
    /// Host serving `RealESRGAN_x{scale}.onnx` exports. Unset disables downloads.
    pub base_url: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: usize,
    pub failure_backoff_secs: u64,
    /// Scale (`"2"`, `"x4"`, ...) → expected SHA-256 hex digest.
    pub sha256: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceOptions {
    pub value_range: ValueRange,
    pub pre_pad: usize,
    /// Tile edge in pixels; 0 processes the whole image in one pass.
    pub tile: usize,
    pub prefer_gpu: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            weights_dir: PathBuf::from("weights"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            failure_backoff_secs: DEFAULT_FAILURE_BACKOFF.as_secs(),
            sha256: BTreeMap::new(),
        }
    }
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            value_range: ValueRange::default(),
            pre_pad: DEFAULT_PRE_PAD,
            tile: 0,
            prefer_gpu: true,
        }
    }
}

impl WeightsConfig {
    pub fn to_settings(&self) -> Result<WeightSettings> {
        let base_url = match self.base_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                Url::parse(raw).with_context(|| format!("invalid weights.base_url: {raw}"))?,
            ),
        };

        let mut checksums = HashMap::new();
        for (key, digest) in &self.sha256 {
            let scale: ScaleFactor = key
                .parse()
                .with_context(|| format!("invalid key in [weights.sha256]: {key}"))?;
            checksums.insert(scale, digest.trim().to_ascii_lowercase());
        }

        Ok(WeightSettings {
            base_url,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_attempts: self.max_attempts.max(1),
            failure_backoff: Duration::from_secs(self.failure_backoff_secs),
            checksums,
        })
    }
}

impl InferenceOptions {
    pub fn to_settings(&self) -> InferenceSettings {
        InferenceSettings {
            tile: self.tile,
            pre_pad: self.pre_pad,
            value_range: self.value_range,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn weights_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.weights_dir)
    }
}

/// Resolve the data directory: CLI override, then `UPSCALER_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.weights_dir, PathBuf::from("weights"));
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(cfg.weights.max_attempts, 3);
        assert_eq!(cfg.weights.connect_timeout_secs, 15);
        assert_eq!(cfg.weights.failure_backoff_secs, 60);
        assert!(cfg.weights.base_url.is_none());
        assert!(cfg.weights.sha256.is_empty());
        assert_eq!(cfg.inference.pre_pad, 10);
        assert_eq!(cfg.inference.tile, 0);
        assert!(cfg.inference.prefer_gpu);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original
            .weights
            .sha256
            .insert("4".to_string(), "ab".repeat(32));
        original.inference.value_range = ValueRange::Byte;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let raw = "[server]\nport = 8080\n\n[inference]\nvalue_range = \"byte\"\n";
        let cfg: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.inference.value_range, ValueRange::Byte);
        assert_eq!(cfg.inference.pre_pad, 10);
        assert_eq!(cfg.weights, WeightsConfig::default());
    }

    #[test]
    fn load_from_missing_or_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("nope.toml");
        assert_eq!(AppConfig::load_from_path(&missing).unwrap(), AppConfig::default());

        let empty = temp.path().join("empty.toml");
        fs::write(&empty, "  \n").unwrap();
        assert_eq!(AppConfig::load_from_path(&empty).unwrap(), AppConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[server\nport = ").unwrap();
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"), "{err}");
    }

    #[test]
    fn weights_config_maps_to_settings() {
        let mut cfg = WeightsConfig {
            base_url: Some("https://mirror.example/models".to_string()),
            connect_timeout_secs: 5,
            request_timeout_secs: 60,
            max_attempts: 0,
            failure_backoff_secs: 0,
            sha256: BTreeMap::new(),
        };
        cfg.sha256.insert("x8".to_string(), " ABCDEF ".to_string());

        let settings = cfg.to_settings().unwrap();
        assert_eq!(
            settings.base_url.as_ref().map(Url::as_str),
            Some("https://mirror.example/models")
        );
        assert_eq!(settings.failure_backoff, Duration::ZERO);
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.request_timeout, Duration::from_secs(60));
        assert_eq!(settings.max_attempts, 1);
        assert_eq!(
            settings.checksums.get(&ScaleFactor::X8).map(String::as_str),
            Some("abcdef")
        );
    }

    #[test]
    fn unset_or_blank_base_url_disables_downloads() {
        assert!(WeightsConfig::default().to_settings().unwrap().base_url.is_none());

        let blank = WeightsConfig {
            base_url: Some("  ".to_string()),
            ..WeightsConfig::default()
        };
        assert!(blank.to_settings().unwrap().base_url.is_none());
    }

    #[test]
    fn weights_config_rejects_bad_values() {
        let bad_url = WeightsConfig {
            base_url: Some("not a url".to_string()),
            ..WeightsConfig::default()
        };
        assert!(bad_url.to_settings().is_err());

        let mut bad_scale = WeightsConfig::default();
        bad_scale.sha256.insert("3".to_string(), "00".to_string());
        let err = bad_scale.to_settings().unwrap_err();
        assert!(err.to_string().contains("[weights.sha256]"), "{err}");
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn weights_dir_resolves_against_data_dir() {
        let mut cfg = AppConfig::default();
        assert_eq!(
            cfg.weights_dir(Path::new("/srv/upscaler")),
            PathBuf::from("/srv/upscaler/weights")
        );
        cfg.paths.weights_dir = PathBuf::from("/opt/weights");
        assert_eq!(
            cfg.weights_dir(Path::new("/srv/upscaler")),
            PathBuf::from("/opt/weights")
        );
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&data)).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }
}
