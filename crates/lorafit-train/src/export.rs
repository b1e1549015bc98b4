//! Adapter and merged-model export.
//!
//! ## Adapter
//!
//! ```text
//! <dir>/
//!   adapter_model.safetensors   LoRA A/B tensors, PEFT names
//!   adapter_config.json         PEFT LoraConfig
//! ```
//!
//! Loadable with `peft.PeftModel.from_pretrained(base, dir)`.
//!
//! ## Merged model
//!
//! ```text
//! <dir>/
//!   model.safetensors       base weights with adapters folded in
//!   config.json             base config, torch_dtype rewritten
//!   tokenizer.json …        copied from the base model directory
//!   generation_config.json  copied when present
//! ```
//!
//! GGUF output first writes the SafeTensors layout, then runs llama.cpp's
//! converter (and `llama-quantize` when available) over it.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lorafit_core::{LoraConfig, LoraModel, QuantMode};

pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG: &str = "adapter_config.json";

// ── OutputFormat ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Hugging Face SafeTensors + `config.json`.
    #[default]
    SafeTensors,
    /// GGUF (requires `llama.cpp` on PATH).
    Gguf,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "safetensor" | "safetensors" => Ok(Self::SafeTensors),
            "gguf" => Ok(Self::Gguf),
            other => bail!("Unknown output format '{}'. Valid values: safetensors, gguf.", other),
        }
    }
}

// ── ExportDtype ───────────────────────────────────────────────────────────────

/// Precision of the merged weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportDtype {
    F32,
    #[default]
    F16,
    BF16,
}

impl ExportDtype {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" => Ok(Self::F32),
            "f16" | "float16" | "fp16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            other => bail!("Unknown export dtype '{other}'. Valid values: f32, f16, bf16."),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
        }
    }

    /// Value written to `config.json`'s `torch_dtype`.
    pub fn torch_name(&self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
        }
    }

    fn gguf_outtype(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
        }
    }
}

// ── adapter_config.json ───────────────────────────────────────────────────────

/// PEFT's `adapter_config.json` for a LoRA adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfigJson {
    pub peft_type: String,
    pub task_type: String,
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default = "default_true")]
    pub inference_mode: bool,
}

fn default_bias() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

impl AdapterConfigJson {
    pub fn new(lora: &LoraConfig, base_model: Option<&str>) -> Self {
        Self {
            peft_type: "LORA".into(),
            task_type: "CAUSAL_LM".into(),
            r: lora.r,
            lora_alpha: lora.alpha,
            lora_dropout: lora.dropout,
            target_modules: lora.target_modules.clone(),
            bias: default_bias(),
            base_model_name_or_path: base_model.map(str::to_owned),
            fan_in_fan_out: false,
            inference_mode: true,
        }
    }

    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            r: self.r,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
        }
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

/// Write the adapter weights and a PEFT `adapter_config.json` to `dir`.
pub fn save_adapter(model: &LoraModel, base_model: Option<&str>, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create adapter dir: {}", dir.display()))?;

    let weights = dir.join(ADAPTER_WEIGHTS);
    model
        .save_adapter(&weights)
        .with_context(|| format!("Cannot write {}", weights.display()))?;

    let cfg = AdapterConfigJson::new(model.lora_config(), base_model);
    let cfg_path = dir.join(ADAPTER_CONFIG);
    std::fs::write(&cfg_path, serde_json::to_string_pretty(&cfg)?)
        .with_context(|| format!("Cannot write {}", cfg_path.display()))?;

    info!(dir = %dir.display(), params = model.trainable_parameters(), "Adapter saved");
    Ok(())
}

pub fn read_adapter_config(dir: &Path) -> Result<AdapterConfigJson> {
    let path = dir.join(ADAPTER_CONFIG);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let cfg: AdapterConfigJson = serde_json::from_str(&json)
        .with_context(|| format!("Invalid adapter config: {}", path.display()))?;
    if cfg.peft_type != "LORA" {
        bail!("{} describes a '{}' adapter; only LORA is supported", path.display(), cfg.peft_type);
    }
    Ok(cfg)
}

// ── Merged export ─────────────────────────────────────────────────────────────

/// Fold the adapters into the base weights and write a standalone model.
///
/// A model trained over a quantized base is merged into a dense copy of the
/// base read from `base_model_dir`, so the export carries no quantization
/// rounding.
pub fn export_merged(
    model: &LoraModel,
    base_model_dir: &Path,
    output_dir: &Path,
    format: OutputFormat,
    dtype: ExportDtype,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Cannot create output dir: {}", output_dir.display()))?;

    // ── Weights ───────────────────────────────────────────────────────────────
    let dense;
    let source = if model.quant_mode() == QuantMode::None {
        model
    } else {
        info!(quant = model.quant_mode().label(), "Reloading dense base weights for the merge");
        let mut reloaded = LoraModel::load(
            base_model_dir,
            model.lora_config(),
            QuantMode::None,
            model.dtype(),
            model.device(),
        )
        .with_context(|| format!("Failed to reload base model from {}", base_model_dir.display()))?;
        reloaded
            .copy_adapter_from(model)
            .context("Failed to transfer adapter weights to the dense base")?;
        dense = reloaded;
        &dense
    };
    let tensors = source
        .merged_state_dict(dtype.dtype())
        .context("Failed to merge adapter weights")?;
    let weights_path = output_dir.join("model.safetensors");
    candle_core::safetensors::save(&tensors, &weights_path)
        .with_context(|| format!("Cannot write {}", weights_path.display()))?;
    info!(path = %weights_path.display(), tensors = tensors.len(), dtype = dtype.torch_name(), "Merged weights saved");

    // ── config.json ───────────────────────────────────────────────────────────
    write_config(base_model_dir, output_dir, dtype)?;

    // ── Tokenizer + generation config ─────────────────────────────────────────
    copy_side_files(base_model_dir, output_dir)?;

    if format == OutputFormat::Gguf {
        export_gguf(output_dir, dtype)?;
    }

    info!(output_dir = %output_dir.display(), "Merged export complete");
    Ok(())
}

/// Copy the base `config.json`, keeping every field it has (rope scaling,
/// token ids, …) and updating only `torch_dtype`.
fn write_config(base_model_dir: &Path, output_dir: &Path, dtype: ExportDtype) -> Result<()> {
    let src = base_model_dir.join("config.json");
    let json = std::fs::read_to_string(&src)
        .with_context(|| format!("Cannot read {}", src.display()))?;
    let mut config: serde_json::Value = serde_json::from_str(&json)?;
    config["torch_dtype"] = dtype.torch_name().into();
    let dst = output_dir.join("config.json");
    std::fs::write(&dst, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("Cannot write {}", dst.display()))?;
    Ok(())
}

fn copy_side_files(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    let candidates = [
        "tokenizer.json",
        "tokenizer_config.json",
        "tokenizer.model",
        "special_tokens_map.json",
        "vocab.json",
        "merges.txt",
        "generation_config.json",
    ];

    for name in &candidates {
        let src = src_dir.join(name);
        if src.exists() {
            std::fs::copy(&src, dst_dir.join(name))
                .with_context(|| format!("Failed to copy {name}"))?;
            info!(file = name, "Copied from base model");
        }
    }
    Ok(())
}

// ── GGUF conversion ───────────────────────────────────────────────────────────

/// Convert the SafeTensors export in `dir` with `convert_hf_to_gguf.py`
/// (run with python3) or a `convert-hf-to-gguf` binary, whichever is on PATH.
fn export_gguf(dir: &Path, dtype: ExportDtype) -> Result<()> {
    let gguf_out = dir.join("model.gguf");

    let converted = if let Some(script) = python_converter() {
        run_converter(Command::new("python3").arg(script), dir, &gguf_out, dtype)?;
        true
    } else if which_on_path("convert-hf-to-gguf").is_some() {
        run_converter(&mut Command::new("convert-hf-to-gguf"), dir, &gguf_out, dtype)?;
        true
    } else {
        false
    };

    if !converted {
        bail!(
            "GGUF conversion requires llama.cpp to be installed.\n\
             Please install it and ensure one of the following is on your PATH:\n\
             - convert_hf_to_gguf.py  (from https://github.com/ggerganov/llama.cpp)\n\
             - convert-hf-to-gguf     (llama.cpp CLI binary)\n\
             \n\
             The merged SafeTensors model is already in {dir}",
            dir = dir.display()
        );
    }

    try_quantize(&gguf_out, &dir.join("model-q4_0.gguf"));
    Ok(())
}

fn python_converter() -> Option<PathBuf> {
    Command::new("python3").arg("-c").arg("import sys").output().ok()?;
    which_on_path("convert_hf_to_gguf.py")
}

fn run_converter(cmd: &mut Command, dir: &Path, out: &Path, dtype: ExportDtype) -> Result<()> {
    info!(outtype = dtype.gguf_outtype(), "Running GGUF converter …");
    let status = cmd
        .arg(dir)
        .arg("--outfile")
        .arg(out)
        .arg("--outtype")
        .arg(dtype.gguf_outtype())
        .status()
        .context("Failed to run GGUF converter")?;
    if !status.success() {
        bail!("GGUF converter exited with {status}");
    }
    info!(path = %out.display(), "GGUF conversion complete");
    Ok(())
}

/// Q4_0 copy via `llama-quantize`; skipped with a warning when the tool is
/// missing.
fn try_quantize(src: &Path, dst: &Path) {
    if which_on_path("llama-quantize").is_none() {
        warn!(
            "llama-quantize not found on PATH; skipping Q4_0 quantisation. \
             Run manually: llama-quantize {} {} Q4_0",
            src.display(),
            dst.display()
        );
        return;
    }

    info!("Running llama-quantize Q4_0 …");
    match Command::new("llama-quantize").arg(src).arg(dst).arg("Q4_0").status() {
        Ok(s) if s.success() => info!(path = %dst.display(), "Q4_0 quantisation complete"),
        Ok(s) => warn!("llama-quantize exited with {s}"),
        Err(e) => warn!(error = %e, "llama-quantize failed"),
    }
}

fn which_on_path(name: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_tiny_model;
    use candle_core::{Device, Tensor};
    use tempfile::TempDir;

    fn load(dir: &Path, lora: &LoraConfig) -> LoraModel {
        LoraModel::load(dir, lora, QuantMode::None, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn parse_formats_and_dtypes() {
        assert_eq!(OutputFormat::parse("safetensor").unwrap(), OutputFormat::SafeTensors);
        assert_eq!(OutputFormat::parse("GGUF").unwrap(), OutputFormat::Gguf);
        assert!(OutputFormat::parse("bin").is_err());
        assert_eq!(ExportDtype::parse("bf16").unwrap().torch_name(), "bfloat16");
        assert_eq!(ExportDtype::parse("float32").unwrap().dtype(), DType::F32);
        assert!(ExportDtype::parse("int8").is_err());
    }

    #[test]
    fn adapter_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        write_tiny_model(&base);
        let lora = LoraConfig { r: 4, alpha: 8.0, ..Default::default() };
        let model = load(&base, &lora);

        let out = dir.path().join("adapter");
        save_adapter(&model, Some("org/tiny"), &out).unwrap();
        assert!(out.join(ADAPTER_WEIGHTS).exists());

        let cfg = read_adapter_config(&out).unwrap();
        assert_eq!(cfg.peft_type, "LORA");
        assert_eq!(cfg.task_type, "CAUSAL_LM");
        assert_eq!(cfg.base_model_name_or_path.as_deref(), Some("org/tiny"));
        assert_eq!(cfg.lora_config(), lora);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join(ADAPTER_CONFIG)).unwrap()).unwrap();
        assert_eq!(raw["lora_alpha"], 8.0);
        assert_eq!(raw["bias"], "none");
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn quantized_training_exports_dense_base() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        write_tiny_model(&base);
        let lora = LoraConfig { r: 4, target_modules: vec!["q_proj".into()], ..Default::default() };
        let quantized = LoraModel::load(&base, &lora, QuantMode::Q4_0, DType::F32, &Device::Cpu).unwrap();
        for var in quantized.trainable_vars() {
            var.set(&Tensor::randn(0f32, 0.1, var.shape(), &Device::Cpu).unwrap()).unwrap();
        }

        let out = dir.path().join("merged");
        export_merged(&quantized, &base, &out, OutputFormat::SafeTensors, ExportDtype::F32).unwrap();
        let merged = candle_core::safetensors::load(out.join("model.safetensors"), &Device::Cpu).unwrap();
        let original = candle_core::safetensors::load(base.join("model.safetensors"), &Device::Cpu).unwrap();

        // Untargeted projections are the base weights bit for bit.
        let gate = "model.layers.0.mlp.gate_proj.weight";
        assert_eq!(max_abs_diff(&merged[gate], &original[gate]), 0.0);

        // Same result as merging the saved adapter into a dense base.
        let adapter_dir = dir.path().join("adapter");
        save_adapter(&quantized, None, &adapter_dir).unwrap();
        let mut dense = load(&base, &lora);
        dense.load_adapter(&adapter_dir.join(ADAPTER_WEIGHTS)).unwrap();
        let expected = dense.merged_state_dict(DType::F32).unwrap();
        let q = "model.layers.1.self_attn.q_proj.weight";
        assert_eq!(max_abs_diff(&merged[q], &expected[q]), 0.0);
        assert!(max_abs_diff(&merged[q], &original[q]) > 0.0);
    }

    #[test]
    fn merged_export_reloads_with_same_outputs() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        write_tiny_model(&base);
        let lora = LoraConfig { r: 4, dropout: 0.0, ..Default::default() };
        let model = load(&base, &lora);
        for var in model.trainable_vars() {
            var.set(&Tensor::randn(0f32, 0.1, var.shape(), &Device::Cpu).unwrap()).unwrap();
        }

        let out = dir.path().join("merged");
        export_merged(&model, &base, &out, OutputFormat::SafeTensors, ExportDtype::F32).unwrap();
        for f in ["model.safetensors", "config.json", "tokenizer.json", "generation_config.json"] {
            assert!(out.join(f).exists(), "{f} missing");
        }
        let cfg: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("config.json")).unwrap()).unwrap();
        assert_eq!(cfg["torch_dtype"], "float32");
        assert_eq!(cfg["architectures"][0], "LlamaForCausalLM");

        let ids = Tensor::new(&[[1u32, 8, 9, 10]], &Device::Cpu).unwrap();
        let expected = model.forward(&ids, None, false).unwrap();
        let merged = load(&out, &lora);
        let actual = merged.forward(&ids, None, false).unwrap();
        let diff: f32 = (expected - actual).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-4, "merged model diverged by {diff}");
    }

    #[test]
    fn f16_export_rewrites_dtype() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        write_tiny_model(&base);
        let model = load(&base, &LoraConfig { r: 2, ..Default::default() });
        let out = dir.path().join("merged");
        export_merged(&model, &base, &out, OutputFormat::SafeTensors, ExportDtype::F16).unwrap();

        let tensors = candle_core::safetensors::load(out.join("model.safetensors"), &Device::Cpu).unwrap();
        assert_eq!(tensors["model.embed_tokens.weight"].dtype(), DType::F16);
        let cfg = std::fs::read_to_string(out.join("config.json")).unwrap();
        assert!(cfg.contains("\"float16\""));
    }

    #[test]
    fn rejects_non_lora_adapter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(ADAPTER_CONFIG),
            r#"{"peft_type":"IA3","task_type":"CAUSAL_LM","r":8,"lora_alpha":16,
                "lora_dropout":0.0,"target_modules":["q_proj"]}"#,
        )
        .unwrap();
        assert!(read_adapter_config(dir.path()).is_err());
    }
}
