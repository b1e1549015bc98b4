//! Learning-rate schedules with linear warmup.

use std::f64::consts::PI;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedule {
    Constant,
    #[default]
    Linear,
    Cosine,
}

impl LrSchedule {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "constant" => Self::Constant,
            "linear" => Self::Linear,
            "cosine" => Self::Cosine,
            other => bail!("Unknown lr schedule '{other}'. Valid values: constant, linear, cosine."),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::Linear => "linear",
            Self::Cosine => "cosine",
        }
    }

    /// Learning rate for optimizer step `step` (0-based).
    ///
    /// Warmup ramps linearly from `base_lr / warmup_steps` to `base_lr`; the
    /// decaying schedules then fall to zero at `total_steps`.
    pub fn learning_rate(&self, step: usize, total_steps: usize, warmup_steps: usize, base_lr: f64) -> f64 {
        if step < warmup_steps {
            return base_lr * (step + 1) as f64 / warmup_steps as f64;
        }
        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = ((step - warmup_steps) as f64 / decay_steps as f64).min(1.0);
        match self {
            Self::Constant => base_lr,
            Self::Linear => base_lr * (1.0 - progress),
            Self::Cosine => base_lr * 0.5 * (1.0 + (PI * progress).cos()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn warmup_ramps_to_base() {
        let s = LrSchedule::Linear;
        assert!(close(s.learning_rate(0, 100, 4, 1.0), 0.25));
        assert!(close(s.learning_rate(3, 100, 4, 1.0), 1.0));
    }

    #[test]
    fn linear_decays_to_zero() {
        let s = LrSchedule::Linear;
        assert!(close(s.learning_rate(0, 10, 0, 2.0), 2.0));
        assert!(close(s.learning_rate(5, 10, 0, 2.0), 1.0));
        assert!(close(s.learning_rate(10, 10, 0, 2.0), 0.0));
    }

    #[test]
    fn cosine_midpoint_is_half() {
        let s = LrSchedule::Cosine;
        assert!(close(s.learning_rate(0, 10, 0, 1.0), 1.0));
        assert!(close(s.learning_rate(5, 10, 0, 1.0), 0.5));
    }

    #[test]
    fn constant_ignores_progress() {
        assert!(close(LrSchedule::Constant.learning_rate(99, 100, 0, 3e-4), 3e-4));
    }

    #[test]
    fn parse_names() {
        assert_eq!(LrSchedule::parse("Cosine").unwrap(), LrSchedule::Cosine);
        assert!(LrSchedule::parse("step").is_err());
    }
}
