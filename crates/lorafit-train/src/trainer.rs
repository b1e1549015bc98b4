//! Supervised LoRA fine-tuning loop.
//!
//! Each optimizer step accumulates gradients over
//! `gradient_accumulation_steps` micro-batches, clips them by global norm,
//! applies the scheduled learning rate and updates the adapter variables
//! with AdamW. The base model never receives an update.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lorafit_core::{LoraModel, Tokenizer};

use crate::collate::{collate, encode_example, BatchTensors, EncodedExample};
use crate::dataset::InstructionDataset;
use crate::export::save_adapter;
use crate::schedule::LrSchedule;
use crate::template::PromptTemplate;

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Examples per micro-batch.
    pub batch_size: usize,
    /// Micro-batches per optimizer step.
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub lr_schedule: LrSchedule,
    /// Fraction of the total steps spent warming up.
    pub warmup_ratio: f64,
    /// Global gradient-norm ceiling; `0` disables clipping.
    pub max_grad_norm: f64,
    /// Token budget per example (prompt + response).
    pub max_seq_len: usize,
    /// Overrides `epochs` when set.
    pub max_steps: Option<usize>,
    pub logging_steps: usize,
    /// Write `checkpoint-{step}/` every this many steps.
    pub save_steps: Option<usize>,
    /// Checkpoints kept on disk; `0` keeps all of them.
    pub save_total_limit: usize,
    /// Supervise prompt tokens as well as the response.
    pub train_on_prompt: bool,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 4,
            gradient_accumulation_steps: 4,
            learning_rate: 2e-4,
            weight_decay: 0.001,
            lr_schedule: LrSchedule::Linear,
            warmup_ratio: 0.03,
            max_grad_norm: 0.3,
            max_seq_len: 512,
            max_steps: None,
            logging_steps: 10,
            save_steps: None,
            save_total_limit: 2,
            train_on_prompt: false,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.epochs > 0 || self.max_steps.is_some(), "epochs must be > 0");
        anyhow::ensure!(self.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(self.gradient_accumulation_steps > 0, "gradient_accumulation_steps must be > 0");
        anyhow::ensure!(self.learning_rate > 0.0, "learning_rate must be > 0");
        anyhow::ensure!((0.0..1.0).contains(&self.warmup_ratio), "warmup_ratio must be in [0, 1)");
        anyhow::ensure!(self.max_seq_len >= 2, "max_seq_len must be at least 2");
        anyhow::ensure!(self.max_steps != Some(0), "max_steps must be > 0 when set");
        anyhow::ensure!(self.save_steps != Some(0), "save_steps must be > 0 when set");
        Ok(())
    }
}

// ── Training statistics ───────────────────────────────────────────────────────

/// One entry of `trainer_state.json`'s `log_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    /// Mean step loss since the previous entry.
    pub loss: f32,
    pub learning_rate: f64,
    pub grad_norm: f32,
}

/// Summary returned after training completes.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingStats {
    pub total_steps: usize,
    pub final_loss: f32,
    pub elapsed_secs: f64,
    pub tokens_per_sec: f64,
    pub trainable_params: usize,
    pub total_params: usize,
}

#[derive(Serialize)]
struct TrainerState<'a> {
    global_step: usize,
    epoch: f64,
    train_runtime_secs: f64,
    train_tokens_per_second: f64,
    trainable_params: usize,
    total_params: usize,
    config: &'a TrainingConfig,
    log_history: &'a [LogEntry],
}

// ── Trainer ───────────────────────────────────────────────────────────────────

pub struct Trainer {
    model: LoraModel,
    tokenizer: Tokenizer,
    template: PromptTemplate,
    system: String,
    base_model: Option<String>,
    config: TrainingConfig,
    output_dir: PathBuf,
    log_history: Vec<LogEntry>,
}

impl Trainer {
    /// `output_dir` receives checkpoints and `trainer_state.json`; it is
    /// created if it does not exist.
    pub fn new(
        model: LoraModel,
        tokenizer: Tokenizer,
        template: PromptTemplate,
        config: TrainingConfig,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            model,
            tokenizer,
            template,
            system: String::new(),
            base_model: None,
            config,
            output_dir,
            log_history: Vec::new(),
        }
    }

    /// System prompt rendered into every example.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    /// Recorded as `base_model_name_or_path` in checkpoint adapter configs.
    pub fn with_base_model(mut self, base_model: impl Into<String>) -> Self {
        self.base_model = Some(base_model.into());
        self
    }

    pub fn model(&self) -> &LoraModel {
        &self.model
    }

    pub fn into_model(self) -> LoraModel {
        self.model
    }

    pub fn log_history(&self) -> &[LogEntry] {
        &self.log_history
    }

    pub fn train(&mut self, dataset: &InstructionDataset) -> Result<TrainingStats> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Cannot create output dir: {}", self.output_dir.display()))?;

        let encoded = self.encode_dataset(dataset)?;
        let usable = encoded.iter().filter(|e| e.is_some()).count();

        let cfg = self.config.clone();
        let micro_per_epoch = usable.div_ceil(cfg.batch_size);
        let steps_per_epoch = micro_per_epoch.div_ceil(cfg.gradient_accumulation_steps);
        let total_steps = cfg.max_steps.unwrap_or(steps_per_epoch * cfg.epochs);
        let warmup_steps = (total_steps as f64 * cfg.warmup_ratio).ceil() as usize;

        let vars = self.model.trainable_vars();
        let trainable_params = self.model.trainable_parameters();
        let total_params = self.model.total_parameters();

        info!(
            examples = usable,
            epochs = cfg.epochs,
            steps_per_epoch,
            total_steps,
            warmup_steps,
            batch_size = cfg.batch_size,
            grad_accum = cfg.gradient_accumulation_steps,
            lr = cfg.learning_rate,
            schedule = cfg.lr_schedule.name(),
            trainable_params,
            total_params,
            "Starting LoRA fine-tuning"
        );

        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: cfg.weight_decay,
            ..Default::default()
        };
        let mut optimizer =
            AdamW::new(vars.clone(), params).context("Failed to create AdamW optimiser")?;

        let pb = progress_bar(total_steps as u64);
        let start = Instant::now();

        let mut global_step = 0usize;
        let mut epoch = 0usize;
        let mut last_loss = f32::NAN;
        let mut total_tokens = 0usize;
        let mut window_losses: Vec<f32> = Vec::new();

        'outer: while global_step < total_steps {
            let order: Vec<&EncodedExample> = dataset
                .shuffled_indices(cfg.seed, epoch)
                .into_iter()
                .filter_map(|i| encoded[i].as_ref())
                .collect();
            let micro_batches: Vec<&[&EncodedExample]> = order.chunks(cfg.batch_size).collect();

            for group in micro_batches.chunks(cfg.gradient_accumulation_steps) {
                let lr = cfg.lr_schedule.learning_rate(global_step, total_steps, warmup_steps, cfg.learning_rate);

                let (step_loss, tokens, mut grads) = self.accumulate(group, &vars)?;
                if !step_loss.is_finite() {
                    bail!("Loss became {step_loss} at step {}; aborting", global_step + 1);
                }
                total_tokens += tokens;

                let grad_norm = clip_grad_norm(&mut grads, cfg.max_grad_norm)?;

                optimizer.set_learning_rate(lr);
                let store = grads.into_store(&vars)?;
                optimizer.step(&store).context("Optimizer step failed")?;

                global_step += 1;
                last_loss = step_loss;
                window_losses.push(step_loss);

                pb.set_message(format!(
                    "epoch {}/{} loss {step_loss:.4} lr {lr:.2e}",
                    epoch + 1,
                    cfg.epochs.max(1)
                ));
                pb.inc(1);

                if global_step % cfg.logging_steps.max(1) == 0 || global_step == total_steps {
                    let entry = LogEntry {
                        step: global_step,
                        epoch: global_step as f64 / steps_per_epoch.max(1) as f64,
                        loss: window_losses.iter().sum::<f32>() / window_losses.len() as f32,
                        learning_rate: lr,
                        grad_norm,
                    };
                    info!(
                        step = entry.step,
                        epoch = entry.epoch,
                        loss = entry.loss,
                        lr = entry.learning_rate,
                        grad_norm = entry.grad_norm,
                        "train"
                    );
                    self.log_history.push(entry);
                    window_losses.clear();
                }

                if let Some(every) = cfg.save_steps {
                    if global_step % every == 0 && global_step < total_steps {
                        self.save_checkpoint(global_step)?;
                    }
                }

                if global_step >= total_steps {
                    break 'outer;
                }
            }

            info!(epoch = epoch + 1, loss = last_loss, "Epoch complete");
            epoch += 1;
        }

        pb.finish_with_message(format!("Training complete, final loss {last_loss:.4}"));

        let elapsed = start.elapsed().as_secs_f64();
        let tps = if elapsed > 0.0 { total_tokens as f64 / elapsed } else { 0.0 };

        let state = TrainerState {
            global_step,
            epoch: global_step as f64 / steps_per_epoch.max(1) as f64,
            train_runtime_secs: elapsed,
            train_tokens_per_second: tps,
            trainable_params,
            total_params,
            config: &self.config,
            log_history: &self.log_history,
        };
        let state_path = self.output_dir.join("trainer_state.json");
        std::fs::write(&state_path, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("Cannot write {}", state_path.display()))?;

        Ok(TrainingStats {
            total_steps: global_step,
            final_loss: last_loss,
            elapsed_secs: elapsed,
            tokens_per_sec: tps,
            trainable_params,
            total_params,
        })
    }

    /// Tokenize every example once; slots for examples that truncation
    /// leaves unsupervised stay `None`.
    fn encode_dataset(&self, dataset: &InstructionDataset) -> Result<Vec<Option<EncodedExample>>> {
        let encoded = dataset
            .as_slice()
            .iter()
            .map(|ex| {
                encode_example(
                    &self.tokenizer,
                    self.template,
                    ex,
                    &self.system,
                    self.config.max_seq_len,
                    self.config.train_on_prompt,
                )
            })
            .collect::<Result<Vec<_>>>()
            .context("Tokenisation error")?;

        let skipped = encoded.iter().filter(|e| e.is_none()).count();
        if skipped > 0 {
            warn!(
                skipped,
                max_seq_len = self.config.max_seq_len,
                "Examples with no response tokens left after truncation were dropped"
            );
        }
        if skipped == encoded.len() {
            bail!("No trainable examples: every example was truncated away (max_seq_len = {})", self.config.max_seq_len);
        }
        Ok(encoded)
    }

    /// Forward and backward over one group of micro-batches, summing the
    /// adapter gradients. Returns the mean micro-batch loss and the number
    /// of input tokens processed.
    fn accumulate(
        &self,
        group: &[&[&EncodedExample]],
        vars: &[Var],
    ) -> Result<(f32, usize, AccumulatedGrads)> {
        let pad_id = self.tokenizer.pad_token_id();
        let device = self.model.device().clone();
        let mut acc = AccumulatedGrads::new(vars.len());
        let mut loss_sum = 0f32;
        let mut tokens = 0usize;

        for micro in group {
            let batch = collate(micro, pad_id);
            tokens += batch.num_tokens();
            let n_targets = batch.num_targets();
            let t = batch.to_tensors(&device)?;

            let logits = self
                .model
                .forward(&t.input_ids, Some(&t.attention_mask), true)
                .context("Forward pass failed")?;
            let loss = masked_cross_entropy(&logits, &t, n_targets)?;
            let value = loss.to_scalar::<f32>()?;
            loss_sum += value;
            debug!(loss = value, targets = n_targets, "micro-batch");
            if !value.is_finite() {
                return Ok((value, tokens, acc));
            }

            let scaled = (loss / group.len() as f64)?;
            let store = scaled.backward().context("Backward pass failed")?;
            acc.add(store, vars)?;
        }

        Ok((loss_sum / group.len() as f32, tokens, acc))
    }

    fn save_checkpoint(&self, step: usize) -> Result<()> {
        let dir = self.output_dir.join(format!("checkpoint-{step}"));
        save_adapter(&self.model, self.base_model.as_deref(), &dir)?;
        info!(step, dir = %dir.display(), "Checkpoint saved");
        rotate_checkpoints(&self.output_dir, self.config.save_total_limit)
    }
}

// ── Loss ──────────────────────────────────────────────────────────────────────

/// Mean next-token cross-entropy over the positions selected by `loss_mask`.
fn masked_cross_entropy(logits: &Tensor, batch: &BatchTensors, n_targets: usize) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((b * t, v))?, D::Minus1)?;
    let labels = batch.labels.flatten_all()?.unsqueeze(1)?;
    let nll = log_probs.gather(&labels, 1)?.squeeze(1)?.neg()?;
    let mask = batch.loss_mask.flatten_all()?;
    Ok(((nll * mask)?.sum_all()? / n_targets.max(1) as f64)?)
}

// ── Gradient accumulation ─────────────────────────────────────────────────────

/// Per-variable gradient sums, aligned with the trainable `Var` list.
struct AccumulatedGrads {
    grads: Vec<Option<Tensor>>,
    /// Last backward store; handed to the optimizer with the sums swapped in.
    store: Option<GradStore>,
}

impl AccumulatedGrads {
    fn new(n: usize) -> Self {
        Self { grads: vec![None; n], store: None }
    }

    fn add(&mut self, store: GradStore, vars: &[Var]) -> Result<()> {
        for (slot, var) in self.grads.iter_mut().zip(vars) {
            if let Some(g) = store.get(var.as_tensor()) {
                *slot = Some(match slot.take() {
                    Some(acc) => (acc + g)?,
                    None => g.clone(),
                });
            }
        }
        self.store = Some(store);
        Ok(())
    }

    fn tensors_mut(&mut self) -> impl Iterator<Item = &mut Tensor> {
        self.grads.iter_mut().flatten()
    }

    fn into_store(self, vars: &[Var]) -> Result<GradStore> {
        let Some(mut store) = self.store else {
            bail!("No gradients were accumulated for this step");
        };
        for (grad, var) in self.grads.into_iter().zip(vars) {
            match grad {
                Some(g) => store.insert(var.as_tensor(), g),
                None => store.remove(var.as_tensor()),
            };
        }
        Ok(store)
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`. Returns
/// the norm before clipping.
fn clip_grad_norm(grads: &mut AccumulatedGrads, max_norm: f64) -> Result<f32> {
    let mut sq = 0f32;
    for g in grads.tensors_mut() {
        sq += g.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    }
    let norm = sq.sqrt();
    if max_norm > 0.0 && (norm as f64) > max_norm {
        let scale = max_norm / (norm as f64 + 1e-6);
        for g in grads.tensors_mut() {
            *g = (&*g * scale)?;
        }
    }
    Ok(norm)
}

// ── Checkpoints ───────────────────────────────────────────────────────────────

/// Delete the oldest `checkpoint-{step}` directories beyond `limit`.
fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<()> {
    if limit == 0 {
        return Ok(());
    }
    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(output_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let step = name.strip_prefix("checkpoint-")?.parse().ok()?;
            Some((step, e.path()))
        })
        .collect();
    checkpoints.sort_by_key(|(step, _)| *step);

    let excess = checkpoints.len().saturating_sub(limit);
    for (step, path) in checkpoints.into_iter().take(excess) {
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Cannot remove {}", path.display()))?;
        debug!(step, "Old checkpoint removed");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░"),
    );
    pb.set_message("LoRA fine-tuning");
    pb
}

// ── Tests ─────────────────────────────────────────────────────────────────────
