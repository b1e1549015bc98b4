//! Llama-family causal LM with LoRA adapters injected into its projections.
//!
//! `candle_transformers::models::llama::Llama` only returns last-position
//! logits and caches keys/values for generation, so training gets its own
//! forward pass here: every position produces logits, attention honours a
//! padding mask, and every op is a differentiable candle primitive.
//!
//! Weight names follow the Hugging Face layout
//! (`model.layers.{i}.self_attn.q_proj.weight`, …) so merged exports load
//! back into `transformers` unchanged.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Embedding, VarBuilder, VarMap};
use candle_transformers::utils::repeat_kv;
use tracing::info;

use crate::config::{safetensor_paths, ModelArgs};
use crate::error::{CoreError, CoreResult};
use crate::lora::{AdaptedLinear, LoraConfig, LoraLinear};
use crate::quant::{FrozenLinear, QuantMode};

/// Prefix PEFT uses for adapter tensors of a causal LM.
pub const ADAPTER_PREFIX: &str = "base_model.model.model.layers";

/// Additive bias for masked attention scores.
const MASK_VALUE: f32 = -1e9;

// ── Building blocks ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(vb: VarBuilder, size: usize, eps: f64) -> CoreResult<Self> {
        Ok(Self { weight: vb.get(size, "weight")?, eps })
    }

    fn forward(&self, xs: &Tensor) -> CoreResult<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let rms = (xs.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        let normed = xs.broadcast_div(&rms)?;
        let weight = self.weight.to_dtype(DType::F32)?;
        Ok(normed.broadcast_mul(&weight)?.to_dtype(dtype)?)
    }
}

/// Rotary position embedding in the "rotate half" layout used by HF Llama.
#[derive(Debug)]
struct Rotary {
    inv_freq: Vec<f32>,
}

impl Rotary {
    fn new(head_dim: usize, base: f64) -> Self {
        let inv_freq = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / (base as f32).powf(i as f32 / head_dim as f32))
            .collect();
        Self { inv_freq }
    }

    /// `(cos, sin)`, each `[seq_len, head_dim]`.
    fn tables(&self, seq_len: usize, device: &Device, dtype: DType) -> CoreResult<(Tensor, Tensor)> {
        let half = self.inv_freq.len();
        let inv_freq = Tensor::from_vec(self.inv_freq.clone(), (1, half), device)?;
        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
    }

    /// `xs`: `[batch, heads, seq, head_dim]`.
    fn apply(xs: &Tensor, cos: &Tensor, sin: &Tensor) -> CoreResult<Tensor> {
        let head_dim = xs.dim(D::Minus1)?;
        let x1 = xs.narrow(D::Minus1, 0, head_dim / 2)?;
        let x2 = xs.narrow(D::Minus1, head_dim / 2, head_dim / 2)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        Ok((xs.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?)
    }
}

fn silu(xs: &Tensor) -> CoreResult<Tensor> {
    Ok((xs / (xs.neg()?.exp()? + 1.0)?)?)
}

/// Builds one projection, attaching an adapter when it is targeted.
struct ProjectionBuilder<'a> {
    lora: &'a LoraConfig,
    quant: QuantMode,
}

impl ProjectionBuilder<'_> {
    fn build(
        &self,
        base: &VarBuilder,
        adapters: &VarBuilder,
        name: &str,
        (in_f, out_f): (usize, usize),
        bias: bool,
    ) -> CoreResult<AdaptedLinear> {
        let vb = base.pp(name);
        let weight = vb.get((out_f, in_f), "weight")?;
        let bias = if bias { Some(vb.get(out_f, "bias")?) } else { None };
        let frozen = FrozenLinear::new(weight, bias, self.quant)?;
        if self.lora.targets(name) {
            Ok(AdaptedLinear::Lora(LoraLinear::new(frozen, self.lora, adapters.pp(name))?))
        } else {
            Ok(AdaptedLinear::Frozen(frozen))
        }
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: AdaptedLinear,
    k_proj: AdaptedLinear,
    v_proj: AdaptedLinear,
    o_proj: AdaptedLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(
        base: VarBuilder,
        adapters: VarBuilder,
        builder: &ProjectionBuilder,
        args: &ModelArgs,
    ) -> CoreResult<Self> {
        let hidden = args.hidden_size;
        let head_dim = args.head_dim();
        let q_out = args.num_attention_heads * head_dim;
        let kv_out = args.kv_heads() * head_dim;
        let bias = args.qkv_bias();
        Ok(Self {
            q_proj: builder.build(&base, &adapters, "q_proj", (hidden, q_out), bias)?,
            k_proj: builder.build(&base, &adapters, "k_proj", (hidden, kv_out), bias)?,
            v_proj: builder.build(&base, &adapters, "v_proj", (hidden, kv_out), bias)?,
            o_proj: builder.build(&base, &adapters, "o_proj", (q_out, hidden), false)?,
            num_heads: args.num_attention_heads,
            num_kv_heads: args.kv_heads(),
            head_dim,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> CoreResult<Tensor> {
        let (b, t, _) = xs.dims3()?;

        let q = self.q_proj.forward(xs, train)?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self.k_proj.forward(xs, train)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self.v_proj.forward(xs, train)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = Rotary::apply(&q, cos, sin)?;
        let k = Rotary::apply(&k, cos, sin)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        // Scores and softmax in F32; BF16 exp() overflows too easily.
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)?.to_dtype(DType::F32)? * scale)?;
        let scores = scores.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out, train)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: AdaptedLinear,
    up_proj: AdaptedLinear,
    down_proj: AdaptedLinear,
}

impl Mlp {
    fn load(
        base: VarBuilder,
        adapters: VarBuilder,
        builder: &ProjectionBuilder,
        args: &ModelArgs,
    ) -> CoreResult<Self> {
        let (h, i) = (args.hidden_size, args.intermediate_size);
        Ok(Self {
            gate_proj: builder.build(&base, &adapters, "gate_proj", (h, i), false)?,
            up_proj: builder.build(&base, &adapters, "up_proj", (h, i), false)?,
            down_proj: builder.build(&base, &adapters, "down_proj", (i, h), false)?,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> CoreResult<Tensor> {
        let gate = silu(&self.gate_proj.forward(xs, train)?)?;
        let up = self.up_proj.forward(xs, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn forward(
        &self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> CoreResult<Tensor> {
        let residual = xs;
        let h = self.input_layernorm.forward(xs)?;
        let h = (self.self_attn.forward(&h, cos, sin, mask, train)? + residual)?;
        let residual = &h;
        let out = self.post_attention_layernorm.forward(&h)?;
        Ok((self.mlp.forward(&out, train)? + residual)?)
    }
}

// ── LoraModel ─────────────────────────────────────────────────────────────────

/// Frozen base model plus trainable LoRA adapters.
pub struct LoraModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// `None` when the output projection is tied to the embedding.
    lm_head: Option<FrozenLinear>,
    rotary: Rotary,
    args: ModelArgs,
    lora: LoraConfig,
    quant: QuantMode,
    adapters: VarMap,
    device: Device,
    dtype: DType,
}

impl std::fmt::Debug for LoraModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraModel")
            .field("model_type", &self.args.model_type)
            .field("layers", &self.layers.len())
            .field("r", &self.lora.r)
            .field("quant", &self.quant)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl LoraModel {
    /// Load a base model from `model_dir` (safetensors + `config.json`) and
    /// inject fresh adapters.
    pub fn load(
        model_dir: &Path,
        lora: &LoraConfig,
        quant: QuantMode,
        dtype: DType,
        device: &Device,
    ) -> CoreResult<Self> {
        let args = ModelArgs::from_model_dir(model_dir)?;
        let paths = safetensor_paths(model_dir)?;

        info!(
            model_dir = %model_dir.display(),
            model_type = %args.model_type,
            layers = args.num_hidden_layers,
            hidden_size = args.hidden_size,
            shards = paths.len(),
            quant = quant.label(),
            "Loading base model"
        );

        // SAFETY: the files are not modified while mapped; every tensor is
        // copied out (and possibly quantized) during construction.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&paths, dtype, device)? };
        Self::from_var_builder(args, vb, lora, quant, device)
    }

    /// Build from an in-memory map of base tensors keyed by HF names.
    pub fn from_tensors(
        args: ModelArgs,
        tensors: HashMap<String, Tensor>,
        lora: &LoraConfig,
        quant: QuantMode,
        dtype: DType,
        device: &Device,
    ) -> CoreResult<Self> {
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        Self::from_var_builder(args, vb, lora, quant, device)
    }

    fn from_var_builder(
        args: ModelArgs,
        vb: VarBuilder,
        lora: &LoraConfig,
        quant: QuantMode,
        device: &Device,
    ) -> CoreResult<Self> {
        args.validate()?;
        lora.validate()?;
        let dtype = vb.dtype();

        let adapters = VarMap::new();
        let adapter_vb = VarBuilder::from_varmap(&adapters, DType::F32, device);
        let builder = ProjectionBuilder { lora, quant };

        let embed_weight = vb
            .pp("model.embed_tokens")
            .get((args.vocab_size, args.hidden_size), "weight")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), args.hidden_size);

        let mut layers = Vec::with_capacity(args.num_hidden_layers);
        for i in 0..args.num_hidden_layers {
            let base = vb.pp(format!("model.layers.{i}"));
            let adapter = adapter_vb.pp(format!("{ADAPTER_PREFIX}.{i}"));
            layers.push(DecoderLayer {
                input_layernorm: RmsNorm::load(
                    base.pp("input_layernorm"),
                    args.hidden_size,
                    args.norm_eps(),
                )?,
                self_attn: Attention::load(
                    base.pp("self_attn"),
                    adapter.pp("self_attn"),
                    &builder,
                    &args,
                )?,
                post_attention_layernorm: RmsNorm::load(
                    base.pp("post_attention_layernorm"),
                    args.hidden_size,
                    args.norm_eps(),
                )?,
                mlp: Mlp::load(base.pp("mlp"), adapter.pp("mlp"), &builder, &args)?,
            });
        }

        let norm = RmsNorm::load(vb.pp("model.norm"), args.hidden_size, args.norm_eps())?;

        // Tied checkpoints usually omit lm_head.weight entirely.
        let lm_head = if args.tie_word_embeddings || !vb.contains_tensor("lm_head.weight") {
            None
        } else {
            let w = vb.pp("lm_head").get((args.vocab_size, args.hidden_size), "weight")?;
            Some(FrozenLinear::new(w, None, QuantMode::None)?)
        };

        let rotary = Rotary::new(args.head_dim(), args.rope_base());

        let model = Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            args,
            lora: lora.clone(),
            quant,
            adapters,
            device: device.clone(),
            dtype,
        };

        info!(
            trainable = model.trainable_parameters(),
            total = model.total_parameters(),
            targets = ?model.lora.target_modules,
            r = model.lora.r,
            "LoRA adapters attached"
        );
        Ok(model)
    }

    /// Logits for every position.
    ///
    /// `input_ids`: `[batch, seq]` u32. `attention_mask`: `[batch, seq]` with
    /// 1 for real tokens and 0 for padding. Returns `[batch, seq, vocab]` F32.
    /// `train` enables adapter dropout.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> CoreResult<Tensor> {
        let (b, t) = input_ids.dims2()?;
        let mask = attention_bias(b, t, attention_mask, &self.device)?;
        let (cos, sin) = self.rotary.tables(t, &self.device, self.dtype)?;

        let mut xs = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &cos, &sin, &mask, train)?;
        }
        let xs = self.norm.forward(&xs)?;

        let logits = match &self.lm_head {
            Some(head) => head.forward(&xs)?,
            None => xs.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?,
        };
        Ok(logits.to_dtype(DType::F32)?)
    }

    // ── Parameters ────────────────────────────────────────────────────────────

    /// Adapter variables; the only parameters the optimizer updates.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.adapters.all_vars()
    }

    pub fn trainable_parameters(&self) -> usize {
        self.adapters.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Base plus adapter parameters.
    pub fn total_parameters(&self) -> usize {
        let embed = self.args.vocab_size * self.args.hidden_size;
        let head = self.lm_head.as_ref().map(|h| h.num_parameters()).unwrap_or(0);
        let norms = self.args.hidden_size * (2 * self.layers.len() + 1);
        let projections: usize = self
            .layers
            .iter()
            .flat_map(|l| l.projections())
            .map(|(_, p)| p.base().num_parameters())
            .sum();
        embed + head + norms + projections + self.trainable_parameters()
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn adapter_varmap(&self) -> &VarMap {
        &self.adapters
    }

    /// Storage of the frozen base projections.
    pub fn quant_mode(&self) -> QuantMode {
        self.quant
    }

    /// Dtype of the frozen base weights and activations.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    // ── Adapter persistence ───────────────────────────────────────────────────

    /// Write the adapter tensors to a safetensors file.
    pub fn save_adapter(&self, path: &Path) -> CoreResult<()> {
        self.adapters.save(path)?;
        Ok(())
    }

    /// Overwrite the adapter tensors from a file written by
    /// [`save_adapter`](Self::save_adapter). Every adapter tensor must be
    /// present in the file.
    pub fn load_adapter(&mut self, path: &Path) -> CoreResult<()> {
        self.adapters.load(path)?;
        info!(path = %path.display(), "Adapter weights loaded");
        Ok(())
    }

    /// Overwrite this model's adapter tensors with `other`'s. Both models
    /// must carry the same adapter layout.
    pub fn copy_adapter_from(&mut self, other: &LoraModel) -> CoreResult<()> {
        let source = other
            .adapters
            .data()
            .lock()
            .map_err(|_| CoreError::Lora("adapter map lock poisoned".into()))?;
        let expected = self.adapters.all_vars().len();
        if source.len() != expected {
            return Err(CoreError::Lora(format!(
                "adapter layout mismatch: {} source tensors, {expected} expected",
                source.len()
            )));
        }
        for (name, var) in source.iter() {
            self.adapters.set_one(name, var.as_tensor())?;
        }
        Ok(())
    }

    // ── Merge ─────────────────────────────────────────────────────────────────

    /// Every base tensor under its Hugging Face name, with adapter updates
    /// folded into the targeted projections, converted to `dtype`.
    pub fn merged_state_dict(&self, dtype: DType) -> CoreResult<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        let mut put = |name: String, t: Tensor| -> CoreResult<()> {
            out.insert(name, t.to_dtype(dtype)?.to_device(&Device::Cpu)?);
            Ok(())
        };

        put("model.embed_tokens.weight".into(), self.embed_tokens.embeddings().clone())?;

        for (i, layer) in self.layers.iter().enumerate() {
            let prefix = format!("model.layers.{i}");
            put(
                format!("{prefix}.input_layernorm.weight"),
                layer.input_layernorm.weight.clone(),
            )?;
            put(
                format!("{prefix}.post_attention_layernorm.weight"),
                layer.post_attention_layernorm.weight.clone(),
            )?;
            for (path, proj) in layer.projections() {
                put(format!("{prefix}.{path}.weight"), proj.export_weight()?)?;
                if let Some(bias) = proj.base().bias() {
                    put(format!("{prefix}.{path}.bias"), bias.clone())?;
                }
            }
        }

        put("model.norm.weight".into(), self.norm.weight.clone())?;
        if let Some(head) = &self.lm_head {
            put("lm_head.weight".into(), head.dequantized_weight()?)?;
        }
        Ok(out)
    }
}

impl DecoderLayer {
    /// Projections with their path relative to the layer.
    fn projections(&self) -> [(&'static str, &AdaptedLinear); 7] {
        [
            ("self_attn.q_proj", &self.self_attn.q_proj),
            ("self_attn.k_proj", &self.self_attn.k_proj),
            ("self_attn.v_proj", &self.self_attn.v_proj),
            ("self_attn.o_proj", &self.self_attn.o_proj),
            ("mlp.gate_proj", &self.mlp.gate_proj),
            ("mlp.up_proj", &self.mlp.up_proj),
            ("mlp.down_proj", &self.mlp.down_proj),
        ]
    }
}

/// Causal + key-padding additive mask, `[batch, 1, seq, seq]` F32.
fn attention_bias(
    b: usize,
    t: usize,
    attention_mask: Option<&Tensor>,
    device: &Device,
) -> CoreResult<Tensor> {
    let keep: Option<Vec<Vec<u32>>> = match attention_mask {
        Some(m) => {
            let (mb, mt) = m.dims2()?;
            if (mb, mt) != (b, t) {
                return Err(CoreError::config(
                    "attention_mask",
                    format!("shape ({mb}, {mt}) does not match input ({b}, {t})"),
                ));
            }
            Some(m.to_dtype(DType::U32)?.to_vec2()?)
        }
        None => None,
    };

    let mut bias = vec![0f32; b * t * t];
    for bi in 0..b {
        for i in 0..t {
            for j in 0..t {
                let padded = keep.as_ref().map(|k| k[bi][j] == 0).unwrap_or(false);
                if j > i || padded {
                    bias[(bi * t + i) * t + j] = MASK_VALUE;
                }
            }
        }
    }
    Ok(Tensor::from_vec(bias, (b, 1, t, t), device)?)
}

/// Randomly initialised base weights for `args`, keyed by HF names.
///
/// Lets small configurations be built without a checkpoint on disk, for
/// smoke tests and dry runs of the training loop.
pub fn random_base_weights(args: &ModelArgs, device: &Device) -> CoreResult<HashMap<String, Tensor>> {
    let mut m = HashMap::new();
    let (h, i, v) = (args.hidden_size, args.intermediate_size, args.vocab_size);
    let hd = args.head_dim();
    let (q_out, kv_out) = (args.num_attention_heads * hd, args.kv_heads() * hd);

    let rand = |shape: (usize, usize)| Tensor::randn(0f32, 0.02, shape, device);
    m.insert("model.embed_tokens.weight".to_string(), rand((v, h))?);
    for l in 0..args.num_hidden_layers {
        let p = format!("model.layers.{l}");
        for (name, shape) in [
            ("self_attn.q_proj", (q_out, h)),
            ("self_attn.k_proj", (kv_out, h)),
            ("self_attn.v_proj", (kv_out, h)),
            ("self_attn.o_proj", (h, q_out)),
            ("mlp.gate_proj", (i, h)),
            ("mlp.up_proj", (i, h)),
            ("mlp.down_proj", (h, i)),
        ] {
            m.insert(format!("{p}.{name}.weight"), rand(shape)?);
        }
        if args.qkv_bias() {
            m.insert(format!("{p}.self_attn.q_proj.bias"), Tensor::zeros(q_out, DType::F32, device)?);
            m.insert(format!("{p}.self_attn.k_proj.bias"), Tensor::zeros(kv_out, DType::F32, device)?);
            m.insert(format!("{p}.self_attn.v_proj.bias"), Tensor::zeros(kv_out, DType::F32, device)?);
        }
        m.insert(format!("{p}.input_layernorm.weight"), Tensor::ones(h, DType::F32, device)?);
        m.insert(format!("{p}.post_attention_layernorm.weight"), Tensor::ones(h, DType::F32, device)?);
    }
    m.insert("model.norm.weight".to_string(), Tensor::ones(h, DType::F32, device)?);
    if !args.tie_word_embeddings {
        m.insert("lm_head.weight".to_string(), rand((v, h))?);
    }
    Ok(m)
}
