//! `lorafit merge`: fold a saved adapter into its base model and export.

use std::path::Path;

use anyhow::{Context, Result};
use indicatif::MultiProgress;
use tracing::info;

use lorafit_core::{select_device, training_dtype, LoraModel, QuantMode};
use lorafit_hub::{resolve_model, ModelCache};
use lorafit_train::export::ADAPTER_WEIGHTS;
use lorafit_train::{export_merged, read_adapter_config, ExportDtype, OutputFormat};

use crate::config::AppConfig;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    model: &str,
    adapter_dir: &Path,
    output: &Path,
    revision: Option<&str>,
    export_format: &str,
    export_dtype: &str,
    gpu: Option<bool>,
    config: &AppConfig,
) -> Result<()> {
    let output_format = OutputFormat::parse(export_format)
        .with_context(|| format!("Invalid --export-format '{export_format}'"))?;
    let dtype = ExportDtype::parse(export_dtype)
        .with_context(|| format!("Invalid --export-dtype '{export_dtype}'"))?;

    let adapter_cfg = read_adapter_config(adapter_dir)?;
    let lora_cfg = adapter_cfg.lora_config();
    info!(
        adapter = %adapter_dir.display(),
        r = lora_cfg.r,
        alpha = lora_cfg.alpha,
        targets = ?lora_cfg.target_modules,
        "Adapter config loaded"
    );

    let revision = revision.unwrap_or(&config.model.revision);
    let cache = ModelCache::new(&config.model.cache_dir)?;
    let mp = MultiProgress::new();
    let model_dir = resolve_model(model, &cache, revision, Some(&mp))
        .await
        .with_context(|| format!("Failed to resolve model '{model}'"))?;

    // Merged weights are computed from the dense base.
    let device = select_device(config.device.use_gpu(gpu), config.device.cuda_device_id)?;
    let mut lora_model = LoraModel::load(&model_dir, &lora_cfg, QuantMode::None, training_dtype(&device), &device)
        .with_context(|| format!("Failed to load model from {}", model_dir.display()))?;
    lora_model
        .load_adapter(&adapter_dir.join(ADAPTER_WEIGHTS))
        .with_context(|| format!("Adapter in {} does not match the base model", adapter_dir.display()))?;

    export_merged(&lora_model, &model_dir, output, output_format, dtype)?;

    println!("\nMerged model written to {}", output.display());
    Ok(())
}
