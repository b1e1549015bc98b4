use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use hf_hub::{
    api::tokio::{Api, ApiBuilder, ApiRepo},
    Repo, RepoType,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::{
    cache::{FileMetadata, ModelCache},
    error::{HubError, HubResult},
    integrity::sha256_file,
};

/// Files every trainable snapshot needs besides its weights.
const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json"];

/// Fetched when present; their absence is not an error.
const OPTIONAL_FILES: &[&str] = &[
    "tokenizer_config.json",
    "special_tokens_map.json",
    "generation_config.json",
    "tokenizer.model",
];

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const SAFETENSORS_SINGLE: &str = "model.safetensors";

const PB_TEMPLATE_SIZED: &str =
    "{wide_msg}\n[{bar:50.cyan/blue}] {bytes}/{total_bytes}  {bytes_per_sec}  ETA {eta}";
const PB_TEMPLATE_SPINNER: &str =
    "{spinner:.green} {wide_msg}  {bytes}  {bytes_per_sec}  [{elapsed_precise}]";

const AUTH_HINT: &str = " (hint: set HF_TOKEN for gated repos)";

// ─── Downloader ───────────────────────────────────────────────────────────────

/// Pulls base model snapshots from the Hugging Face Hub into a [`ModelCache`].
pub struct ModelDownloader {
    cache: ModelCache,
    api: Api,
    http: reqwest::Client,
    hf_token: Option<String>,
}

impl ModelDownloader {
    /// Reads `HF_TOKEN` (or the older `HUGGING_FACE_HUB_TOKEN`) from the
    /// environment when set.
    pub fn new(cache: ModelCache) -> HubResult<Self> {
        let hf_token = pick_token(
            std::env::var("HF_TOKEN").ok(),
            std::env::var("HUGGING_FACE_HUB_TOKEN").ok(),
        );

        let api = ApiBuilder::new()
            .with_token(hf_token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| HubError::DownloadFailed {
                file: "<api init>".into(),
                reason: e.to_string(),
            })?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("lorafit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::DownloadFailed {
                file: "<http client>".into(),
                reason: e.to_string(),
            })?;

        Ok(Self { cache, api, http, hf_token })
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Download config, tokenizer and safetensors weights for `repo_id` at
    /// `revision`. Returns the snapshot directory.
    pub async fn pull(
        &self,
        repo_id: &str,
        revision: &str,
        mp: Option<&MultiProgress>,
    ) -> HubResult<PathBuf> {
        info!(repo_id, revision, "Pulling model");

        let repo = self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let mut required: Vec<String> = REQUIRED_FILES.iter().map(|s| s.to_string()).collect();

        // The index is small; fetch it through our own cache so shard
        // discovery works offline on a second run.
        match self.download_file(&repo, repo_id, revision, SAFETENSORS_INDEX, mp).await {
            Ok(index_path) => {
                let json = std::fs::read_to_string(&index_path).map_err(HubError::Io)?;
                let index: serde_json::Value = serde_json::from_str(&json)?;
                let shards = shard_filenames(&index);
                if shards.is_empty() {
                    return Err(HubError::DownloadFailed {
                        file: SAFETENSORS_INDEX.into(),
                        reason: "weight_map is empty".into(),
                    });
                }
                info!(shards = shards.len(), "Sharded safetensors checkpoint");
                required.extend(shards);
            }
            Err(e) => {
                debug!(error = %e, "No safetensors index; expecting a single weights file");
                required.push(SAFETENSORS_SINGLE.to_string());
            }
        }

        for filename in &required {
            self.download_file(&repo, repo_id, revision, filename, mp).await?;
        }
        for filename in OPTIONAL_FILES {
            if let Err(e) = self.download_file(&repo, repo_id, revision, filename, mp).await {
                debug!(filename, error = %e, "Optional file not available, skipping");
            }
        }

        Ok(self.cache.model_dir(repo_id, revision))
    }

    // ─── Download engine ──────────────────────────────────────────────────────

    /// Stream one file into the cache, skipping it when a verified copy is
    /// already present.
    async fn download_file(
        &self,
        repo: &ApiRepo,
        repo_id: &str,
        revision: &str,
        filename: &str,
        mp: Option<&MultiProgress>,
    ) -> HubResult<PathBuf> {
        let dest = self.cache.file_path(repo_id, revision, filename);

        if self.cache.verify_cached(repo_id, revision, filename)? {
            debug!(filename, "Already cached, skipping download");
            return Ok(dest);
        }
        if dest.exists() {
            warn!(filename, "Re-downloading file that failed verification");
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(HubError::Io)?;
        }

        let url = repo.url(filename);
        debug!(filename, %url, "Downloading");

        let mut req = self.http.get(&url);
        if let Some(ref token) = self.hf_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let response = req.send().await.map_err(|e| HubError::DownloadFailed {
            file: filename.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let hint = if matches!(status.as_u16(), 401 | 403) { AUTH_HINT } else { "" };
            return Err(HubError::DownloadFailed {
                file: filename.to_string(),
                reason: format!("HTTP {status}{hint}"),
            });
        }

        let pb = mp.map(|m| progress_bar(m, response.content_length(), filename));

        let tmp_path = dest.with_file_name(format!(
            "{}.tmp",
            dest.file_name().unwrap_or_default().to_string_lossy()
        ));

        if let Err(e) = stream_to_disk(response, &tmp_path, pb.as_ref()).await {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        std::fs::rename(&tmp_path, &dest).map_err(HubError::Io)?;

        let sha256 = sha256_file(&dest)?;
        let size_bytes = std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
        self.cache.write_meta(&FileMetadata {
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
            filename: filename.to_string(),
            sha256,
            size_bytes,
        })?;

        if let Some(ref pb) = pb {
            pb.finish_with_message(format!("Done  {filename}"));
        }
        info!(filename, size_bytes, "Downloaded");
        Ok(dest)
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn stream_to_disk(
    response: reqwest::Response,
    path: &Path,
    pb: Option<&ProgressBar>,
) -> HubResult<()> {
    use std::io::Write;

    let mut file = std::io::BufWriter::new(std::fs::File::create(path).map_err(HubError::Io)?);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HubError::DownloadFailed {
            file: path.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
        file.write_all(&chunk).map_err(HubError::Io)?;
        if let Some(pb) = pb {
            pb.inc(chunk.len() as u64);
        }
    }

    file.flush().map_err(HubError::Io)?;
    Ok(())
}

fn progress_bar(mp: &MultiProgress, total: Option<u64>, filename: &str) -> ProgressBar {
    let pb = match total {
        Some(total) => {
            let pb = mp.add(ProgressBar::new(total));
            pb.set_style(
                ProgressStyle::with_template(PB_TEMPLATE_SIZED)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            pb
        }
        None => {
            let pb = mp.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::with_template(PB_TEMPLATE_SPINNER)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb
        }
    };
    pb.set_message(filename.to_string());
    pb
}

/// Distinct shard filenames named by a `model.safetensors.index.json`, sorted.
fn shard_filenames(index: &serde_json::Value) -> Vec<String> {
    index["weight_map"]
        .as_object()
        .map(|m| {
            m.values()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        })
        .unwrap_or_default()
}

fn pick_token(hf_token: Option<String>, legacy: Option<String>) -> Option<String> {
    hf_token
        .filter(|t| !t.is_empty())
        .or_else(|| legacy.filter(|t| !t.is_empty()))
}
