use std::path::Path;

use serde::{Deserialize, Deserializer};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Thin wrapper around the Hugging Face `tokenizers` crate.
#[derive(Debug)]
pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: Option<u32>,
    bos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

/// The subset of `tokenizer_config.json` that names special tokens.
///
/// Values are either a bare string or an `AddedToken` object with a
/// `content` field, depending on the `transformers` version that wrote it.
#[derive(Debug, Default, Deserialize)]
struct TokenizerConfigJson {
    eos_token: Option<SpecialToken>,
    /// `None` when the key is absent, `Some(None)` for an explicit `null`.
    #[serde(default, deserialize_with = "explicit_null")]
    bos_token: Option<Option<SpecialToken>>,
    pad_token: Option<SpecialToken>,
}

fn explicit_null<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Added { content: String },
}

impl SpecialToken {
    fn content(&self) -> &str {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Added { content } => content,
        }
    }
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(Self::with_probed_specials(inner))
    }

    /// Load `tokenizer.json` from a model directory, honouring the special
    /// tokens named in `tokenizer_config.json` when that file is present.
    pub fn from_model_dir(dir: &Path) -> CoreResult<Self> {
        let path = dir.join("tokenizer.json");
        if !path.exists() {
            return Err(CoreError::config(
                "tokenizer",
                format!("No tokenizer.json found in {}", dir.display()),
            ));
        }
        let mut tok = Self::from_file(&path)?;

        let cfg_path = dir.join("tokenizer_config.json");
        if cfg_path.exists() {
            let json = std::fs::read_to_string(&cfg_path)?;
            // An unreadable config keeps the probed ids.
            match serde_json::from_str::<TokenizerConfigJson>(&json) {
                Ok(cfg) => tok.apply_config(&cfg),
                Err(e) => warn!(
                    path = %cfg_path.display(),
                    error = %e,
                    "Ignoring malformed tokenizer_config.json; special tokens keep their probed ids"
                ),
            }
        }

        debug!(
            eos = tok.eos_token_id,
            bos = tok.bos_token_id,
            pad = tok.pad_token_id,
            vocab_size = tok.vocab_size(),
            "Tokenizer loaded"
        );
        Ok(tok)
    }

    /// Wrap an already-built `tokenizers` instance, probing the vocabulary
    /// for the usual special tokens.
    pub fn from_hf(inner: HfTokenizer) -> Self {
        Self::with_probed_specials(inner)
    }

    fn with_probed_specials(inner: HfTokenizer) -> Self {
        let eos_token_id = Self::special_token_id(
            &inner,
            &["</s>", "<|endoftext|>", "<|end_of_text|>", "<|im_end|>", "<eos>"],
        );
        let bos_token_id = Self::special_token_id(
            &inner,
            &["<s>", "<|begin_of_text|>", "<|startoftext|>", "<bos>"],
        );
        let pad_token_id = Self::special_token_id(&inner, &["<pad>", "<|pad|>"]);
        Self { inner, eos_token_id, bos_token_id, pad_token_id }
    }

    fn apply_config(&mut self, cfg: &TokenizerConfigJson) {
        if let Some(id) = cfg.eos_token.as_ref().and_then(|t| self.token_id(t.content())) {
            self.eos_token_id = Some(id);
        }
        if let Some(id) = cfg.pad_token.as_ref().and_then(|t| self.token_id(t.content())) {
            self.pad_token_id = Some(id);
        }
        // An explicit `null` bos_token (Qwen2) means the model is trained
        // without a BOS marker.
        match &cfg.bos_token {
            Some(Some(t)) => self.bos_token_id = self.token_id(t.content()),
            Some(None) => self.bos_token_id = None,
            None => {}
        }
    }

    /// Encode a text string to a sequence of token ids.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> CoreResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode a sequence of token ids back to a string.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> CoreResult<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))
    }

    /// The end-of-sequence token id, if known.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// The beginning-of-sequence token id, if the model uses one.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Token id used to right-pad batches: the configured pad token, else
    /// EOS, else 0. Padded positions never contribute to the loss.
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id.or(self.eos_token_id).unwrap_or(0)
    }

    /// The size of the vocabulary including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Look up the token id for an exact token string (e.g. `"<|im_end|>"`).
    pub fn token_id(&self, text: &str) -> Option<u32> {
        self.inner.token_to_id(text)
    }

    fn special_token_id(tokenizer: &HfTokenizer, candidates: &[&str]) -> Option<u32> {
        candidates.iter().find_map(|c| tokenizer.token_to_id(c))
    }
}
