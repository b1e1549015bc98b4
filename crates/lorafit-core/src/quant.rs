//! Frozen base-model linear layers, optionally held in GGML block-quantized
//! form to cut the resident size of the base model.
//!
//! Quantized weights are dequantized on every forward pass. The result is a
//! plain tensor, not a `Var`, so gradients flow through to the activations
//! (and on to the LoRA adapters of earlier layers) while the base weights
//! themselves stay frozen.

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Module, Tensor};
use candle_nn::Linear;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// How the frozen base projections are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantMode {
    /// Keep base weights dense in the training dtype.
    #[default]
    None,
    /// 8-bit blocks (`Q8_0`).
    Q8_0,
    /// 4-bit blocks (`Q4_0`), the QLoRA-style setting.
    Q4_0,
}

impl QuantMode {
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "none" | "off" | "" => Ok(Self::None),
            "8bit" | "q8_0" | "int8" => Ok(Self::Q8_0),
            "4bit" | "q4_0" | "int4" => Ok(Self::Q4_0),
            other => Err(CoreError::config(
                "quantization",
                format!("unknown mode '{other}'. Valid values: none, 8bit, 4bit."),
            )),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Q8_0 => "q8_0",
            Self::Q4_0 => "q4_0",
        }
    }

    fn ggml_dtype(&self) -> Option<GgmlDType> {
        match self {
            Self::None => None,
            Self::Q8_0 => Some(GgmlDType::Q8_0),
            Self::Q4_0 => Some(GgmlDType::Q4_0),
        }
    }
}

enum FrozenWeight {
    Dense(Tensor),
    Quantized(QTensor),
}

/// A linear projection whose weight never receives gradients.
pub struct FrozenLinear {
    weight: FrozenWeight,
    bias: Option<Tensor>,
    /// Dtype activations are expected in; quantized weights are
    /// dequantized to it.
    dtype: DType,
    in_features: usize,
    out_features: usize,
}

impl std::fmt::Debug for FrozenLinear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenLinear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("quantized", &self.is_quantized())
            .finish()
    }
}

impl FrozenLinear {
    /// Wrap a `[out, in]` weight, quantizing it when `mode` asks for it and
    /// the input dimension is a whole number of quantization blocks.
    pub fn new(weight: Tensor, bias: Option<Tensor>, mode: QuantMode) -> CoreResult<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let dtype = weight.dtype();

        let weight = match mode.ggml_dtype() {
            Some(gdt) if in_features % gdt.block_size() == 0 => {
                let q = QTensor::quantize(&weight.to_dtype(DType::F32)?, gdt)?;
                FrozenWeight::Quantized(q)
            }
            Some(gdt) => {
                debug!(
                    in_features,
                    block = gdt.block_size(),
                    "Input dim not a multiple of the block size; keeping layer dense"
                );
                FrozenWeight::Dense(weight)
            }
            None => FrozenWeight::Dense(weight),
        };

        Ok(Self { weight, bias, dtype, in_features, out_features })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, FrozenWeight::Quantized(_))
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// The base weight as a dense `[out, in]` tensor in the activation dtype.
    pub fn dequantized_weight(&self) -> CoreResult<Tensor> {
        match &self.weight {
            FrozenWeight::Dense(w) => Ok(w.clone()),
            FrozenWeight::Quantized(q) => {
                let device = q.device();
                Ok(q.dequantize(&device)?.to_dtype(self.dtype)?)
            }
        }
    }

    /// Number of scalar parameters (weight + bias).
    pub fn num_parameters(&self) -> usize {
        self.in_features * self.out_features
            + self.bias.as_ref().map(|b| b.elem_count()).unwrap_or(0)
    }

    pub fn forward(&self, xs: &Tensor) -> CoreResult<Tensor> {
        let weight = self.dequantized_weight()?;
        let linear = Linear::new(weight, self.bias.clone());
        Ok(linear.forward(xs)?)
    }
}
