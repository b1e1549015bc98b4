use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};
use crate::integrity::verify_integrity;

/// Sidecar metadata written next to every downloaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub repo_id: String,
    pub revision: String,
    pub filename: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// On-disk cache of base model snapshots.
///
/// Layout: `<root>/<owner__repo>/<revision>/<filename>`, with a
/// `<filename>.meta.json` sidecar per file.
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    /// Create a cache rooted at `root` (a leading `~` is expanded).
    pub fn new(root: impl Into<PathBuf>) -> HubResult<Self> {
        let root = expand_tilde(&root.into());
        std::fs::create_dir_all(&root).map_err(HubError::Io)?;
        Ok(Self { root })
    }

    /// `~/.cache/lorafit`.
    pub fn default_cache() -> HubResult<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            HubError::InvalidCacheDir("Cannot determine home directory".to_string())
        })?;
        Self::new(home.join(".cache").join("lorafit"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every file of one `(repo_id, revision)` snapshot.
    pub fn model_dir(&self, repo_id: &str, revision: &str) -> PathBuf {
        self.root.join(repo_id.replace('/', "__")).join(revision)
    }

    pub fn file_path(&self, repo_id: &str, revision: &str, filename: &str) -> PathBuf {
        self.model_dir(repo_id, revision).join(filename)
    }

    pub fn meta_path(&self, repo_id: &str, revision: &str, filename: &str) -> PathBuf {
        self.model_dir(repo_id, revision)
            .join(format!("{filename}.meta.json"))
    }

    /// Both the data file and its sidecar exist.
    pub fn is_cached(&self, repo_id: &str, revision: &str, filename: &str) -> bool {
        self.file_path(repo_id, revision, filename).exists()
            && self.meta_path(repo_id, revision, filename).exists()
    }

    pub fn write_meta(&self, meta: &FileMetadata) -> HubResult<()> {
        let path = self.meta_path(&meta.repo_id, &meta.revision, &meta.filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(HubError::Io)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(meta)?).map_err(HubError::Io)?;
        debug!(path = %path.display(), "Wrote metadata");
        Ok(())
    }

    pub fn read_meta(&self, repo_id: &str, revision: &str, filename: &str) -> HubResult<FileMetadata> {
        let path = self.meta_path(repo_id, revision, filename);
        let json = std::fs::read_to_string(&path).map_err(HubError::Io)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Re-hash a cached file and compare it with its sidecar.
    ///
    /// Returns `Ok(false)` when the file is missing or corrupted, so callers
    /// can download it again.
    pub fn verify_cached(&self, repo_id: &str, revision: &str, filename: &str) -> HubResult<bool> {
        if !self.is_cached(repo_id, revision, filename) {
            return Ok(false);
        }
        let meta = self.read_meta(repo_id, revision, filename)?;
        let path = self.file_path(repo_id, revision, filename);
        match verify_integrity(&path, &meta.sha256) {
            Ok(()) => Ok(true),
            Err(HubError::IntegrityMismatch { expected, actual, .. }) => {
                warn!(filename, %expected, %actual, "Cached file failed verification");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::sha256_file;
    use tempfile::TempDir;

    fn temp_cache() -> (ModelCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(dir.path().join("cache")).unwrap();
        (cache, dir)
    }

    fn cache_file(cache: &ModelCache, contents: &[u8]) {
        let path = cache.file_path("org/model", "main", "config.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        cache
            .write_meta(&FileMetadata {
                repo_id: "org/model".into(),
                revision: "main".into(),
                filename: "config.json".into(),
                sha256: sha256_file(&path).unwrap(),
                size_bytes: contents.len() as u64,
            })
            .unwrap();
    }

    #[test]
    fn test_layout_encodes_slash() {
        let (cache, _dir) = temp_cache();
        let p = cache.file_path("owner/repo", "main", "config.json");
        assert!(p.starts_with(cache.model_dir("owner/repo", "main")));
        assert!(p.to_string_lossy().contains("owner__repo"));
        let m = cache.meta_path("owner/repo", "main", "model.safetensors");
        assert!(m.to_string_lossy().ends_with("model.safetensors.meta.json"));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let (cache, _dir) = temp_cache();
        assert!(!cache.is_cached("org/model", "main", "config.json"));
        cache_file(&cache, b"{}");
        assert!(cache.is_cached("org/model", "main", "config.json"));
        let meta = cache.read_meta("org/model", "main", "config.json").unwrap();
        assert_eq!(meta.size_bytes, 2);
    }

    #[test]
    fn test_verify_cached_detects_corruption() {
        let (cache, _dir) = temp_cache();
        cache_file(&cache, b"{\"hidden_size\": 8}");
        assert!(cache.verify_cached("org/model", "main", "config.json").unwrap());

        std::fs::write(cache.file_path("org/model", "main", "config.json"), b"garbage").unwrap();
        assert!(!cache.verify_cached("org/model", "main", "config.json").unwrap());
    }

    #[test]
    fn test_verify_cached_missing_is_false() {
        let (cache, _dir) = temp_cache();
        assert!(!cache.verify_cached("org/model", "main", "tokenizer.json").unwrap());
    }
}
