use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use lorafit_core::LoraConfig;
use lorafit_train::TrainingConfig;

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    pub model: ModelCacheConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub lora: LoraConfig,
    pub quantization: QuantizationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelCacheConfig {
    pub cache_dir: String,
    /// Hub revision used when `--revision` is not given.
    pub revision: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    pub cuda_device_id: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuantizationConfig {
    /// `none`, `8bit` or `4bit`.
    pub mode: String,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: "~/.cache/lorafit".to_string(),
            revision: "main".to_string(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { prefer_gpu: true, cuda_device_id: 0 }
    }
}

impl DeviceConfig {
    /// A `--gpu` flag wins over `prefer_gpu`.
    pub fn use_gpu(&self, flag: Option<bool>) -> bool {
        flag.unwrap_or(self.prefer_gpu)
    }
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self { mode: "none".to_string() }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `LORAFIT_`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in; [training] and [lora] fall back to
        // their serde defaults field by field.
        .set_default("model.cache_dir", "~/.cache/lorafit")?
        .set_default("model.revision", "main")?
        .set_default("device.prefer_gpu", true)?
        .set_default("device.cuda_device_id", 0_i64)?
        .set_default("quantization.mode", "none")?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (LORAFIT_TRAINING__LEARNING_RATE, etc.).
    // Field names contain underscores, so sections are split on `__`.
    builder = builder.add_source(
        Environment::with_prefix("LORAFIT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
