//! Base model architecture read from a Hugging Face `config.json`.
//!
//! Only Llama-family decoders are supported: `llama`, `mistral` and `qwen2`
//! all share the pre-norm / GQA / RoPE / SwiGLU layout and differ only in
//! defaults (Qwen2 carries q/k/v biases and a smaller RMSNorm epsilon).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const SUPPORTED_MODEL_TYPES: &[&str] = &["llama", "mistral", "qwen2"];

/// Architecture hyper-parameters needed to build the trainable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArgs {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub rms_norm_eps: Option<f64>,
    #[serde(default)]
    pub rope_theta: Option<f64>,
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: Option<bool>,
}

fn default_model_type() -> String {
    "llama".to_string()
}

fn default_max_positions() -> usize {
    2048
}

impl ModelArgs {
    /// Read and validate `<dir>/config.json`.
    pub fn from_model_dir(dir: &Path) -> CoreResult<Self> {
        let path = dir.join("config.json");
        let json = std::fs::read_to_string(&path).map_err(|e| {
            CoreError::config("config.json", format!("cannot read {}: {e}", path.display()))
        })?;
        let args: ModelArgs = serde_json::from_str(&json)?;
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !SUPPORTED_MODEL_TYPES.contains(&self.model_type.as_str()) {
            return Err(CoreError::UnsupportedArchitecture(format!(
                "model_type '{}' (supported: {})",
                self.model_type,
                SUPPORTED_MODEL_TYPES.join(", ")
            )));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(CoreError::config(
                "num_attention_heads",
                format!(
                    "hidden_size {} is not divisible by num_attention_heads {}",
                    self.hidden_size, self.num_attention_heads
                ),
            ));
        }
        let kv = self.kv_heads();
        if kv == 0 || self.num_attention_heads % kv != 0 {
            return Err(CoreError::config(
                "num_key_value_heads",
                format!(
                    "num_attention_heads {} is not divisible by num_key_value_heads {kv}",
                    self.num_attention_heads
                ),
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn norm_eps(&self) -> f64 {
        self.rms_norm_eps.unwrap_or(if self.is_qwen2() { 1e-6 } else { 1e-5 })
    }

    pub fn rope_base(&self) -> f64 {
        self.rope_theta.unwrap_or(10_000.0)
    }

    /// Whether q/k/v projections carry a bias term.
    pub fn qkv_bias(&self) -> bool {
        self.attention_bias.unwrap_or(self.is_qwen2())
    }

    fn is_qwen2(&self) -> bool {
        self.model_type == "qwen2"
    }
}

/// Paths of every safetensors file holding the model weights, in a
/// deterministic order.
///
/// A sharded checkpoint is described by `model.safetensors.index.json`;
/// otherwise a single `model.safetensors` is expected.
pub fn safetensor_paths(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let json = std::fs::read_to_string(&index_path)?;
        let index: serde_json::Value = serde_json::from_str(&json)?;
        let mut shards: Vec<String> = index["weight_map"]
            .as_object()
            .map(|m| {
                m.values()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        shards.sort();
        if shards.is_empty() {
            return Err(CoreError::config(
                "model.safetensors.index.json",
                "weight_map is empty or missing",
            ));
        }
        return Ok(shards.iter().map(|s| dir.join(s)).collect());
    }

    let single = dir.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    Err(CoreError::config(
        "model_dir",
        format!("No safetensors weights found in {}", dir.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TINYLLAMA: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "hidden_size": 2048,
        "intermediate_size": 5632,
        "max_position_embeddings": 2048,
        "model_type": "llama",
        "num_attention_heads": 32,
        "num_hidden_layers": 22,
        "num_key_value_heads": 4,
        "rms_norm_eps": 1e-05,
        "rope_theta": 10000.0,
        "tie_word_embeddings": false,
        "torch_dtype": "bfloat16",
        "vocab_size": 32000
    }"#;

    #[test]
    fn parses_tinyllama_config() {
        let args: ModelArgs = serde_json::from_str(TINYLLAMA).unwrap();
        args.validate().unwrap();
        assert_eq!(args.head_dim(), 64);
        assert_eq!(args.kv_heads(), 4);
        assert!(!args.qkv_bias());
        assert!((args.norm_eps() - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn qwen2_defaults_bias_and_eps() {
        let args: ModelArgs = serde_json::from_str(
            r#"{"model_type":"qwen2","hidden_size":896,"intermediate_size":4864,
                "vocab_size":151936,"num_hidden_layers":24,"num_attention_heads":14,
                "num_key_value_heads":2,"tie_word_embeddings":true}"#,
        )
        .unwrap();
        args.validate().unwrap();
        assert!(args.qkv_bias());
        assert!(args.tie_word_embeddings);
        assert!((args.norm_eps() - 1e-6).abs() < 1e-12);
    }

    #[test]
    fn rejects_unsupported_model_type() {
        let mut args: ModelArgs = serde_json::from_str(TINYLLAMA).unwrap();
        args.model_type = "gpt2".to_string();
        assert!(matches!(args.validate(), Err(CoreError::UnsupportedArchitecture(_))));
    }

    #[test]
    fn rejects_indivisible_kv_heads() {
        let mut args: ModelArgs = serde_json::from_str(TINYLLAMA).unwrap();
        args.num_key_value_heads = Some(5);
        assert!(args.validate().is_err());
    }

    #[test]
    fn safetensor_paths_prefers_index() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map":{"a":"model-00002-of-00002.safetensors",
                "b":"model-00001-of-00002.safetensors",
                "c":"model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        let paths = safetensor_paths(dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("model-00001-of-00002.safetensors"));
    }

    #[test]
    fn safetensor_paths_missing_errors() {
        let dir = TempDir::new().unwrap();
        assert!(safetensor_paths(dir.path()).is_err());
    }
}
