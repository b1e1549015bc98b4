//! `lorafit train`: fine-tune a base model with LoRA, then merge and export.
//!
//! Models that are not a local directory are **automatically downloaded**
//! from Hugging Face before training starts.
//!
//! ```text
//! lorafit train \
//!   --model   Qwen/Qwen2.5-0.5B-Instruct \
//!   --dataset ./data/alpaca.jsonl \
//!   --output  ./output/qwen-alpaca \
//!   --template chatml --quantize 4bit
//! ```
//!
//! ## Output layout
//!
//! ```text
//! <output>/
//!   checkpoint-<step>/      intermediate adapters (--save-steps)
//!   adapter/                final adapter, PEFT layout
//!   merged/                 base + adapter, standalone (unless --no-merge)
//!   trainer_state.json
//! ```

use anyhow::{Context, Result};
use indicatif::MultiProgress;
use tracing::info;

use lorafit_core::{select_device, training_dtype, LoraConfig, LoraModel, QuantMode, Tokenizer};
use lorafit_hub::{resolve_model, ModelCache};
use lorafit_train::{
    export_merged, save_adapter, ExportDtype, InstructionDataset, LrSchedule, OutputFormat,
    PromptTemplate, Trainer, TrainingConfig,
};

use crate::config::AppConfig;
use crate::TrainArgs;

// ── Main entry point ──────────────────────────────────────────────────────────

pub async fn run(args: &TrainArgs, config: &AppConfig) -> Result<()> {
    // ── Parse and merge options up front so bad flags fail fast ───────────────
    let template = PromptTemplate::parse(&args.template)
        .with_context(|| format!("Invalid --template '{}'", args.template))?;
    let output_format = OutputFormat::parse(&args.export_format)
        .with_context(|| format!("Invalid --export-format '{}'", args.export_format))?;
    let export_dtype = ExportDtype::parse(&args.export_dtype)
        .with_context(|| format!("Invalid --export-dtype '{}'", args.export_dtype))?;
    let quant_mode = QuantMode::parse(args.quantize.as_deref().unwrap_or(&config.quantization.mode))?;
    let lora_cfg = lora_config(args, &config.lora);
    lora_cfg.validate()?;
    let train_cfg = training_config(args, &config.training)?;
    train_cfg.validate()?;

    // ── Resolve and load the base model ───────────────────────────────────────
    let revision = args.revision.as_deref().unwrap_or(&config.model.revision);
    let cache = ModelCache::new(&config.model.cache_dir)?;
    let mp = MultiProgress::new();
    let model_dir = resolve_model(&args.model, &cache, revision, Some(&mp))
        .await
        .with_context(|| format!("Failed to resolve model '{}'", args.model))?;

    let device = select_device(config.device.use_gpu(args.gpu), config.device.cuda_device_id)?;
    let tokenizer = Tokenizer::from_model_dir(&model_dir)?;
    let model = LoraModel::load(&model_dir, &lora_cfg, quant_mode, training_dtype(&device), &device)
        .with_context(|| format!("Failed to load model from {}", model_dir.display()))?;

    // ── Load dataset ──────────────────────────────────────────────────────────
    info!(path = %args.dataset.display(), "Loading dataset");
    let dataset = InstructionDataset::load(&args.dataset)
        .with_context(|| format!("Failed to load dataset from {}", args.dataset.display()))?;
    info!(examples = dataset.len(), template = template.name(), "Dataset ready");

    // ── Train ─────────────────────────────────────────────────────────────────
    let mut trainer = Trainer::new(model, tokenizer, template, train_cfg, args.output.clone())
        .with_system(args.system.clone())
        .with_base_model(args.model.clone());
    let stats = trainer.train(&dataset)?;

    info!(
        steps   = stats.total_steps,
        loss    = stats.final_loss,
        elapsed = format!("{:.1}s", stats.elapsed_secs),
        tok_s   = format!("{:.0}", stats.tokens_per_sec),
        "Training complete"
    );

    // ── Save adapter and export ───────────────────────────────────────────────
    let model = trainer.into_model();
    let adapter_dir = args.output.join("adapter");
    save_adapter(&model, Some(&args.model), &adapter_dir)?;

    let merged_dir = args.output.join("merged");
    if args.no_merge {
        info!("--no-merge set, skipping merged export");
    } else {
        info!(format = ?output_format, output = %merged_dir.display(), "Exporting merged model");
        export_merged(&model, &model_dir, &merged_dir, output_format, export_dtype)?;
    }

    println!(
        "\nFine-tuning complete!\n\
         Steps: {} ({} of {} parameters trainable, {:.2}%)\n\
         Final loss: {:.4}\n\
         Elapsed: {:.1} s ({:.0} tok/s)\n\
         Adapter: {}",
        stats.total_steps,
        stats.trainable_params,
        stats.total_params,
        100.0 * stats.trainable_params as f64 / stats.total_params.max(1) as f64,
        stats.final_loss,
        stats.elapsed_secs,
        stats.tokens_per_sec,
        adapter_dir.display(),
    );
    if !args.no_merge {
        println!("Merged model: {}", merged_dir.display());
    }

    Ok(())
}

// ── Flag / config merging ─────────────────────────────────────────────────────

fn lora_config(args: &TrainArgs, base: &LoraConfig) -> LoraConfig {
    LoraConfig {
        r: args.rank.unwrap_or(base.r),
        alpha: args.alpha.unwrap_or(base.alpha),
        dropout: args.lora_dropout.unwrap_or(base.dropout),
        target_modules: args
            .target_modules
            .clone()
            .unwrap_or_else(|| base.target_modules.clone()),
    }
}

fn training_config(args: &TrainArgs, base: &TrainingConfig) -> Result<TrainingConfig> {
    let lr_schedule = match &args.lr_schedule {
        Some(s) => LrSchedule::parse(s).with_context(|| format!("Invalid --lr-schedule '{s}'"))?,
        None => base.lr_schedule,
    };
    Ok(TrainingConfig {
        epochs: args.epochs.unwrap_or(base.epochs),
        batch_size: args.batch_size.unwrap_or(base.batch_size),
        gradient_accumulation_steps: args.grad_accum.unwrap_or(base.gradient_accumulation_steps),
        learning_rate: args.learning_rate.unwrap_or(base.learning_rate),
        weight_decay: args.weight_decay.unwrap_or(base.weight_decay),
        lr_schedule,
        warmup_ratio: args.warmup_ratio.unwrap_or(base.warmup_ratio),
        max_grad_norm: args.max_grad_norm.unwrap_or(base.max_grad_norm),
        max_seq_len: args.max_seq_len.unwrap_or(base.max_seq_len),
        max_steps: args.max_steps.or(base.max_steps),
        logging_steps: args.logging_steps.unwrap_or(base.logging_steps),
        save_steps: args.save_steps.or(base.save_steps),
        save_total_limit: args.save_total_limit.unwrap_or(base.save_total_limit),
        train_on_prompt: args.train_on_prompt || base.train_on_prompt,
        seed: args.seed.unwrap_or(base.seed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrap {
        #[command(flatten)]
        args: TrainArgs,
    }

    fn parse(extra: &[&str]) -> TrainArgs {
        let mut argv = vec!["lorafit", "-m", "base", "-d", "data.jsonl", "-o", "out"];
        argv.extend_from_slice(extra);
        Wrap::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn test_unset_flags_keep_config_values() {
        let base = TrainingConfig { epochs: 7, seed: 1, ..Default::default() };
        let cfg = training_config(&parse(&[]), &base).unwrap();
        assert_eq!(cfg.epochs, 7);
        assert_eq!(cfg.seed, 1);
        assert_eq!(cfg.max_steps, None);
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&[
            "--epochs", "1", "--grad-accum", "8", "--lr-schedule", "cosine",
            "--save-steps", "50", "--train-on-prompt",
        ]);
        let cfg = training_config(&args, &TrainingConfig::default()).unwrap();
        assert_eq!(cfg.epochs, 1);
        assert_eq!(cfg.gradient_accumulation_steps, 8);
        assert_eq!(cfg.lr_schedule, LrSchedule::Cosine);
        assert_eq!(cfg.save_steps, Some(50));
        assert!(cfg.train_on_prompt);
    }

    #[test]
    fn test_bad_schedule_is_rejected() {
        let args = parse(&["--lr-schedule", "exponential"]);
        assert!(training_config(&args, &TrainingConfig::default()).is_err());
    }

    #[test]
    fn test_lora_flags_override_config() {
        let args = parse(&["--rank", "4", "--target-modules", "q_proj,down_proj"]);
        let cfg = lora_config(&args, &LoraConfig::default());
        assert_eq!(cfg.r, 4);
        assert!((cfg.alpha - LoraConfig::default().alpha).abs() < f64::EPSILON);
        assert_eq!(cfg.target_modules, vec!["q_proj", "down_proj"]);
    }
}
