//! Tiny on-disk models and tokenizers shared by the unit tests.

use std::collections::HashMap;
use std::path::Path;

use candle_core::Device;
use lorafit_core::model::random_base_weights;
use lorafit_core::{ModelArgs, Tokenizer};
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;

const WORDS: &[&str] = &[
    "<unk>", "<s>", "</s>", "###", "Instruction", "Input", "Response", ":", "what", "is",
    "the", "answer", "four", "two", "plus", "hello", "world",
];

fn hf_tokenizer() -> tokenizers::Tokenizer {
    let vocab: HashMap<String, u32> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i as u32))
        .collect();
    let model = WordLevel::builder()
        .vocab(vocab.into_iter().collect())
        .unk_token("<unk>".to_string())
        .build()
        .unwrap();
    let mut tok = tokenizers::Tokenizer::new(model);
    tok.with_pre_tokenizer(Some(Whitespace {}));
    tok
}

/// Word-level tokenizer; unknown words map to `<unk>`, `<s>` / `</s>` are
/// BOS / EOS.
pub(crate) fn toy_tokenizer() -> Tokenizer {
    Tokenizer::from_hf(hf_tokenizer())
}

pub(crate) fn tiny_args() -> ModelArgs {
    serde_json::from_value(serde_json::json!({
        "model_type": "llama",
        "hidden_size": 32,
        "intermediate_size": 64,
        "vocab_size": WORDS.len(),
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "max_position_embeddings": 256,
        "torch_dtype": "float32"
    }))
    .unwrap()
}

/// Write `config.json`, `model.safetensors`, `tokenizer.json` and
/// `generation_config.json` for a randomly initialised tiny Llama.
pub(crate) fn write_tiny_model(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    let args = tiny_args();
    let mut config = serde_json::to_value(&args).unwrap();
    config["torch_dtype"] = "float32".into();
    config["architectures"] = serde_json::json!(["LlamaForCausalLM"]);
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let weights = random_base_weights(&args, &Device::Cpu).unwrap();
    candle_core::safetensors::save(&weights, dir.join("model.safetensors")).unwrap();

    hf_tokenizer().save(dir.join("tokenizer.json"), false).unwrap();
    std::fs::write(dir.join("generation_config.json"), r#"{"eos_token_id": 2}"#).unwrap();
}
