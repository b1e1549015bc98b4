//! # lorafit-core
//!
//! The trainable model side of lorafit: a Llama-family decoder whose frozen
//! projections carry low-rank adapters, plus device selection and the
//! tokenizer wrapper.
//!
//! ## Supported Architectures
//!
//! | `model_type` | Notes |
//! |--------------|-------|
//! | `llama` | TinyLlama, Llama 2/3 |
//! | `mistral` | Mistral 7B and derivatives |
//! | `qwen2` | Qwen2 / Qwen2.5, q/k/v biases, tied embeddings on small sizes |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod config;
pub mod device;
pub mod error;
pub mod lora;
pub mod model;
pub mod quant;
pub mod tokenizer;

pub use config::ModelArgs;
pub use device::{select_device, training_dtype};
pub use error::{CoreError, CoreResult};
pub use lora::LoraConfig;
pub use model::LoraModel;
pub use quant::QuantMode;
pub use tokenizer::Tokenizer;
