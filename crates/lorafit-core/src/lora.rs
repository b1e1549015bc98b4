//! Low-rank adapters.
//!
//! A targeted projection `W` becomes `W x + (B A x) * alpha / r` where `A` is
//! `[r, in]` and `B` is `[out, r]`. `B` starts at zero so the adapted model
//! reproduces the base model exactly before the first optimizer step. Only
//! `A` and `B` live in the adapter `VarMap`; `W` is a [`FrozenLinear`].

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::quant::FrozenLinear;

/// Projection names adapters can be attached to.
pub const KNOWN_TARGETS: &[&str] = &[
    "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj",
];

/// Adapter hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Rank of the update.
    pub r: usize,
    /// Scale numerator; the update is multiplied by `alpha / r`.
    pub alpha: f64,
    /// Dropout applied to the adapter input during training.
    pub dropout: f32,
    /// Projection names that receive adapters.
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 32.0,
            dropout: 0.05,
            target_modules: ["q_proj", "k_proj", "v_proj", "o_proj"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.r == 0 {
            return Err(CoreError::Lora("rank r must be greater than zero".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(CoreError::Lora(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(CoreError::Lora("target_modules is empty".into()));
        }
        if let Some(bad) = self
            .target_modules
            .iter()
            .find(|m| !KNOWN_TARGETS.contains(&m.as_str()))
        {
            return Err(CoreError::Lora(format!(
                "unknown target module '{bad}'. Valid values: {}",
                KNOWN_TARGETS.join(", ")
            )));
        }
        Ok(())
    }
}

/// A frozen projection with a trainable low-rank update.
#[derive(Debug)]
pub struct LoraLinear {
    base: FrozenLinear,
    lora_a: Tensor,
    lora_b: Tensor,
    scaling: f64,
    dropout: f32,
}

impl LoraLinear {
    /// Attach an adapter to `base`, registering `lora_A.weight` and
    /// `lora_B.weight` under `vb` (an F32 builder over the adapter `VarMap`).
    pub fn new(base: FrozenLinear, cfg: &LoraConfig, vb: VarBuilder) -> CoreResult<Self> {
        let (in_f, out_f) = (base.in_features(), base.out_features());
        // kaiming_uniform(a = sqrt(5)) reduces to U(-1/sqrt(in), 1/sqrt(in)).
        let bound = 1.0 / (in_f as f64).sqrt();
        let lora_a = vb.get_with_hints(
            (cfg.r, in_f),
            "lora_A.weight",
            Init::Uniform { lo: -bound, up: bound },
        )?;
        let lora_b = vb.get_with_hints((out_f, cfg.r), "lora_B.weight", Init::Const(0.0))?;
        Ok(Self { base, lora_a, lora_b, scaling: cfg.scaling(), dropout: cfg.dropout })
    }

    pub fn base(&self) -> &FrozenLinear {
        &self.base
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> CoreResult<Tensor> {
        let base_out = self.base.forward(xs)?;

        let x = xs.to_dtype(DType::F32)?;
        let x = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&x, self.dropout)?
        } else {
            x
        };
        let update = x
            .broadcast_matmul(&self.lora_a.t()?)?
            .broadcast_matmul(&self.lora_b.t()?)?;
        let update = (update * self.scaling)?.to_dtype(base_out.dtype())?;
        Ok((base_out + update)?)
    }

    /// `(B A) * scaling`, shape `[out, in]`, F32.
    pub fn delta_weight(&self) -> CoreResult<Tensor> {
        Ok((self.lora_b.matmul(&self.lora_a)? * self.scaling)?)
    }

    /// Base weight with the update folded in, F32.
    pub fn merged_weight(&self) -> CoreResult<Tensor> {
        let base = self.base.dequantized_weight()?.to_dtype(DType::F32)?;
        Ok((base + self.delta_weight()?)?)
    }

    pub fn num_adapter_parameters(&self) -> usize {
        self.lora_a.elem_count() + self.lora_b.elem_count()
    }
}

/// A model projection: frozen, or frozen plus adapter.
#[derive(Debug)]
pub enum AdaptedLinear {
    Frozen(FrozenLinear),
    Lora(LoraLinear),
}

impl AdaptedLinear {
    pub fn forward(&self, xs: &Tensor, train: bool) -> CoreResult<Tensor> {
        match self {
            Self::Frozen(l) => l.forward(xs),
            Self::Lora(l) => l.forward(xs, train),
        }
    }

    pub fn base(&self) -> &FrozenLinear {
        match self {
            Self::Frozen(l) => l,
            Self::Lora(l) => l.base(),
        }
    }

    /// Weight to export: the base weight, with the adapter merged when present.
    pub fn export_weight(&self) -> CoreResult<Tensor> {
        match self {
            Self::Frozen(l) => Ok(l.dequantized_weight()?),
            Self::Lora(l) => l.merged_weight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::QuantMode;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn adapted(cfg: &LoraConfig) -> (LoraLinear, VarMap) {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 0.5, (6, 4), &dev).unwrap();
        let base = FrozenLinear::new(w, None, QuantMode::None).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = LoraLinear::new(base, cfg, vb.pp("q_proj")).unwrap();
        (layer, varmap)
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = LoraConfig::default();
        cfg.validate().unwrap();
        assert!((cfg.scaling() - 2.0).abs() < f64::EPSILON);
        assert!(cfg.targets("q_proj"));
        assert!(!cfg.targets("gate_proj"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = LoraConfig { r: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        cfg.r = 8;
        cfg.dropout = 1.0;
        assert!(cfg.validate().is_err());
        cfg.dropout = 0.1;
        cfg.target_modules = vec!["lm_head".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_b_means_identity_to_base() {
        let cfg = LoraConfig { r: 2, dropout: 0.0, ..Default::default() };
        let (layer, _vm) = adapted(&cfg);
        let x = Tensor::randn(0f32, 1.0, (1, 3, 4), &Device::Cpu).unwrap();
        let y = layer.forward(&x, true).unwrap();
        let y_base = layer.base().forward(&x).unwrap();
        let diff: f32 = (y - y_base).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn registers_peft_style_names() {
        let cfg = LoraConfig { r: 2, ..Default::default() };
        let (layer, varmap) = adapted(&cfg);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("q_proj.lora_A.weight"));
        assert!(data.contains_key("q_proj.lora_B.weight"));
        assert_eq!(data["q_proj.lora_A.weight"].dims(), &[2, 4]);
        assert_eq!(data["q_proj.lora_B.weight"].dims(), &[6, 2]);
        assert_eq!(layer.num_adapter_parameters(), 8 + 12);
    }

    #[test]
    fn merged_weight_matches_adapted_forward() {
        let cfg = LoraConfig { r: 2, alpha: 4.0, dropout: 0.0, ..Default::default() };
        let (layer, varmap) = adapted(&cfg);
        // Give B non-zero values so the update is visible.
        {
            let data = varmap.data().lock().unwrap();
            let b = &data["q_proj.lora_B.weight"];
            b.set(&Tensor::ones((6, 2), DType::F32, &Device::Cpu).unwrap()).unwrap();
        }
        let x = Tensor::randn(0f32, 1.0, (2, 4), &Device::Cpu).unwrap();
        let y = layer.forward(&x, false).unwrap();
        let merged = layer.merged_weight().unwrap();
        let y_merged = x.matmul(&merged.t().unwrap()).unwrap();
        let diff: f32 = (y - y_merged).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-4, "merged forward diverged by {diff}");
    }
}
