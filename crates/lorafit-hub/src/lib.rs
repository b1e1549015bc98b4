//! # lorafit-hub
//!
//! Fetches base model snapshots (config, tokenizer, safetensors weights) from
//! the Hugging Face Hub into a local, integrity-checked cache.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lorafit_hub::{resolve_model, ModelCache};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = ModelCache::default_cache()?;
//!     let dir = resolve_model("TinyLlama/TinyLlama-1.1B-Chat-v1.0", &cache, "main", None).await?;
//!     println!("Model files in {}", dir.display());
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};

use indicatif::MultiProgress;
use tracing::info;

pub mod cache;
pub mod download;
pub mod error;
pub mod integrity;

pub use cache::{FileMetadata, ModelCache};
pub use download::ModelDownloader;
pub use error::{HubError, HubResult};

/// Turn a `--model` argument into a directory holding the model files.
///
/// An existing local directory is used as-is. Anything else must look like a
/// Hub repo id (`owner/name`) and is pulled into `cache` at `revision`.
pub async fn resolve_model(
    spec: &str,
    cache: &ModelCache,
    revision: &str,
    mp: Option<&MultiProgress>,
) -> HubResult<PathBuf> {
    let local = Path::new(spec);
    if local.is_dir() {
        info!(path = %local.display(), "Using local model directory");
        return Ok(local.to_path_buf());
    }
    if !is_repo_id(spec) {
        return Err(HubError::InvalidModelSpec(spec.to_string()));
    }
    let downloader = ModelDownloader::new(cache.clone())?;
    downloader.pull(spec, revision, mp).await
}

fn is_repo_id(spec: &str) -> bool {
    let mut parts = spec.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => {
            let ok = |s: &str| {
                !s.is_empty()
                    && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
            };
            ok(owner) && ok(name)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_repo_id() {
        assert!(is_repo_id("TinyLlama/TinyLlama-1.1B-Chat-v1.0"));
        assert!(is_repo_id("Qwen/Qwen2.5-0.5B"));
        assert!(!is_repo_id("gpt2"));
        assert!(!is_repo_id("./models/tiny"));
        assert!(!is_repo_id("a/b/c"));
        assert!(!is_repo_id("owner/"));
    }

    #[tokio::test]
    async fn test_resolve_local_directory() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(dir.path().join("cache")).unwrap();
        let model_dir = dir.path().join("my-model");
        std::fs::create_dir_all(&model_dir).unwrap();

        let resolved = resolve_model(model_dir.to_str().unwrap(), &cache, "main", None)
            .await
            .unwrap();
        assert_eq!(resolved, model_dir);
    }

    #[tokio::test]
    async fn test_resolve_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(dir.path().join("cache")).unwrap();
        let err = resolve_model("not a model", &cache, "main", None).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidModelSpec(_)));
    }
}
