//! Layered recorder configuration.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. a TOML file (`./inference-recorder.toml` or an explicit path)
//! 3. `INFERENCE_TEST_*` environment variables, e.g.
//!    `INFERENCE_TEST_MODE=record-if-missing`

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::error::StoreError;
use crate::mode::{DivergencePolicy, InferenceMode};
use crate::normalize::{DEFAULT_FLOAT_PRECISION, DEFAULT_VOLATILE_FIELDS, Normalizer};
use crate::store::{RecordingStore, validate_suite_name};

pub const ENV_PREFIX: &str = "INFERENCE_TEST";
pub const DEFAULT_CONFIG_FILE: &str = "inference-recorder.toml";
pub const DEFAULT_RECORDING_DIR: &str = "tests/fixtures/recordings";
pub const MAX_FLOAT_PRECISION: u32 = 12;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration value: {0}")]
    Validation(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Recorder settings, fixed for the lifetime of an interceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(deserialize_with = "from_str_value")]
    pub mode: InferenceMode,

    /// Root of the recording store.
    pub recording_dir: PathBuf,

    /// Optional suite partition under `recording_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,

    /// Top-level body fields stripped before fingerprinting.
    pub volatile_fields: Vec<String>,

    /// Decimal places kept when rounding floats.
    pub float_precision: u32,

    #[serde(deserialize_with = "from_str_value")]
    pub divergence: DivergencePolicy,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            mode: InferenceMode::default(),
            recording_dir: PathBuf::from(DEFAULT_RECORDING_DIR),
            suite: None,
            volatile_fields: DEFAULT_VOLATILE_FIELDS
                .iter()
                .map(|field| (*field).to_string())
                .collect(),
            float_precision: DEFAULT_FLOAT_PRECISION,
            divergence: DivergencePolicy::default(),
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.float_precision > MAX_FLOAT_PRECISION {
            return Err(ConfigError::Validation(format!(
                "float_precision must be at most {MAX_FLOAT_PRECISION}, got {}",
                self.float_precision
            )));
        }
        if let Some(suite) = &self.suite {
            validate_suite_name(suite).map_err(|err| ConfigError::Validation(err.to_string()))?;
        }
        Ok(())
    }

    /// Directory recordings are read from and written to.
    pub fn store_dir(&self) -> PathBuf {
        match &self.suite {
            Some(suite) => self.recording_dir.join(suite),
            None => self.recording_dir.clone(),
        }
    }

    pub fn store(&self) -> Result<RecordingStore, StoreError> {
        match &self.suite {
            Some(suite) => RecordingStore::for_suite(&self.recording_dir, suite),
            None => Ok(RecordingStore::new(&self.recording_dir)),
        }
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(
            self.volatile_fields
                .iter()
                .map(String::as_str)
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .map(str::to_string),
            self.float_precision,
        )
    }
}

/// Accepts any spelling the type's `FromStr` accepts (`RECORD_IF_MISSING`,
/// `record-if-missing`, ...).
fn from_str_value<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Loads [`RecorderConfig`] from layered sources.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env: Option<config::Map<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Reads environment overrides from `vars` instead of the process
    /// environment.
    pub fn with_env_source(mut self, vars: config::Map<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    pub fn load(&self) -> Result<RecorderConfig, ConfigError> {
        let mut builder = Config::builder();

        let defaults_json = serde_json::to_string(&RecorderConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("volatile_fields")
                .source(self.env.clone()),
        );

        let recorder: RecorderConfig = builder.build()?.try_deserialize()?;
        recorder.validate()?;
        tracing::debug!(
            mode = %recorder.mode,
            path = %recorder.store_dir().display(),
            "loaded recorder configuration"
        );
        Ok(recorder)
    }

    /// `./inference-recorder.toml` when present.
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from(".").join(DEFAULT_CONFIG_FILE);
        cwd_config.exists().then_some(cwd_config)
    }

    /// Defaults, the default config file if present, then the process
    /// environment.
    pub fn load_default() -> Result<RecorderConfig, ConfigError> {
        let loader = match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path),
            None => ConfigLoader::new(),
        };
        loader.load()
    }
}
