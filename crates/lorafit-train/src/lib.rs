//! # lorafit-train
//!
//! Supervised LoRA fine-tuning for lorafit.
//!
//! 1. **Data**: instruction/input/output records are read from JSON or JSONL
//!    ([`dataset`]) and rendered through a prompt template ([`template`]).
//! 2. **Batching**: examples are tokenized once, truncated to
//!    `max_seq_len`, then shifted and right-padded per micro-batch
//!    ([`collate`]). Prompt tokens are masked out of the loss by default.
//! 3. **Training**: [`Trainer`] runs AdamW over the adapter weights only,
//!    with gradient accumulation, global-norm clipping and a warmup
//!    schedule ([`schedule`]).
//! 4. **Export**: the adapter is saved in PEFT layout, and the adapter can be
//!    folded back into the base weights for a standalone safetensors or GGUF
//!    model ([`export`]).
//!
//! ## Usage
//!
//! ```text
//! lorafit train \
//!   --model   Qwen/Qwen2.5-0.5B-Instruct \
//!   --dataset ./data/alpaca.jsonl \
//!   --output  ./output/qwen-alpaca \
//!   --template chatml \
//!   --rank 16 --alpha 32 --quantize q4_0
//! ```

pub mod collate;
pub mod dataset;
pub mod export;
pub mod schedule;
pub mod template;
pub mod trainer;

#[cfg(test)]
mod test_support;

pub use dataset::{InstructionDataset, InstructionExample};
pub use export::{export_merged, read_adapter_config, save_adapter, ExportDtype, OutputFormat};
pub use schedule::LrSchedule;
pub use template::PromptTemplate;
pub use trainer::{LogEntry, Trainer, TrainingConfig, TrainingStats};
