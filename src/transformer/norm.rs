// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization layers for the generic transformer.
//!
//! Gemma's `(w + 1)` gain is folded into the weight at load time, so every
//! [`NormType`] ends up as either candle's `RmsNorm` or `LayerNorm`.

use candle_core::{Module, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::config::NormType;
use crate::error::Result;

/// A normalization layer, selected at load time by [`NormType`].
// EXHAUSTIVE: internal dispatch enum; the crate matches both variants
#[allow(clippy::exhaustive_enums)]
pub enum Norm {
    /// RMS normalization (also Gemma, with the gain pre-shifted).
    Rms(candle_nn::RmsNorm),
    /// Layer normalization with weight and bias.
    Layer(candle_nn::LayerNorm),
}

impl Module for Norm {
    /// # Shapes
    /// - `xs`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Rms(norm) => norm.forward(xs),
            Self::Layer(norm) => norm.forward(xs),
        }
    }
}

/// Load a [`Norm`] of the given type from `vb` (`weight`, plus `bias` for
/// layer norm).
///
/// # Errors
///
/// Returns [`SteerError::Model`](crate::SteerError::Model) if weight loading fails.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub fn create_norm(
    norm_type: NormType,
    hidden_size: usize,
    eps: f64,
    vb: VarBuilder<'_>,
) -> Result<Norm> {
    let norm = match norm_type {
        NormType::RmsNorm => Norm::Rms(candle_nn::rms_norm(hidden_size, eps, vb)?),
        NormType::LayerNorm => {
            let config = candle_nn::LayerNormConfig {
                eps,
                ..Default::default()
            };
            Norm::Layer(candle_nn::layer_norm(hidden_size, config, vb)?)
        }
        NormType::GemmaRmsNorm => {
            // Gemma checkpoints store `w` and apply `w + 1`; a zero-initialised
            // fresh weight therefore means identity gain.
            let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(0.0))?;
            Norm::Rms(candle_nn::RmsNorm::new((weight + 1.0)?, eps))
        }
    };
    Ok(norm)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn gemma_norm_uses_shifted_gain() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gemma = create_norm(NormType::GemmaRmsNorm, 4, 1e-6, vb.pp("g")).unwrap();
        let rms = create_norm(NormType::RmsNorm, 4, 1e-6, vb.pp("r")).unwrap();

        // Fresh Gemma weight is 0 (gain 1); fresh RMS weight is 1.
        let x = Tensor::new(&[[[1.0_f32, -2.0, 3.0, 0.5]]], &Device::Cpu).unwrap();
        let a: Vec<f32> = gemma.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = rms.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
