// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feed-forward block of the generic transformer.
//!
//! Three layouts:
//! - [`GatedSeparate`](MlpLayout::GatedSeparate): `down(act(gate(x)) * up(x))`
//! - [`GatedFused`](MlpLayout::GatedFused): one `gate_up` matrix, split after projection
//! - [`Plain`](MlpLayout::Plain): `proj(act(fc(x)))` (GPT-2, `StarCoder2`)

use candle_core::{D, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{Activation, MlpLayout, TransformerConfig};
use crate::error::Result;

use super::proj::load_linear;

/// Feed-forward block.
pub struct Mlp {
    /// Layout-specific projections.
    variant: MlpVariant,
    /// Activation function.
    activation: Activation,
}

/// Projections of each layout.
enum MlpVariant {
    /// Separate gate and up projections.
    GatedSeparate {
        /// `hidden -> intermediate`, activated.
        gate_proj: Linear,
        /// `hidden -> intermediate`.
        up_proj: Linear,
        /// `intermediate -> hidden`.
        down_proj: Linear,
    },
    /// Fused gate/up projection (Phi-3).
    GatedFused {
        /// `hidden -> 2 * intermediate`, gate half first.
        gate_up_proj: Linear,
        /// `intermediate -> hidden`.
        down_proj: Linear,
        /// Split point of the fused output.
        intermediate_size: usize,
    },
    /// Non-gated MLP.
    Plain {
        /// `hidden -> intermediate` (`c_fc`).
        fc: Linear,
        /// `intermediate -> hidden` (`c_proj`).
        proj: Linear,
    },
}

impl Mlp {
    /// Load MLP weights.
    ///
    /// Weight names: `gate_proj`/`up_proj`/`down_proj`, `gate_up_proj`/`down_proj`,
    /// or `c_fc`/`c_proj`, depending on the layout.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let bias = config.mlp_bias;
        let layout = config.weight_layout;

        let variant = match config.mlp_layout {
            MlpLayout::GatedSeparate => MlpVariant::GatedSeparate {
                gate_proj: load_linear(hidden, inter, bias, layout, vb.pp("gate_proj"))?,
                up_proj: load_linear(hidden, inter, bias, layout, vb.pp("up_proj"))?,
                down_proj: load_linear(inter, hidden, bias, layout, vb.pp("down_proj"))?,
            },
            MlpLayout::GatedFused => MlpVariant::GatedFused {
                gate_up_proj: load_linear(hidden, 2 * inter, bias, layout, vb.pp("gate_up_proj"))?,
                down_proj: load_linear(inter, hidden, bias, layout, vb.pp("down_proj"))?,
                intermediate_size: inter,
            },
            MlpLayout::Plain => MlpVariant::Plain {
                fc: load_linear(hidden, inter, bias, layout, vb.pp("c_fc"))?,
                proj: load_linear(inter, hidden, bias, layout, vb.pp("c_proj"))?,
            },
        };

        Ok(Self {
            variant,
            activation: config.activation,
        })
    }

    /// Projections that read the MLP input directly.
    ///
    /// These are the only consumers of the pre-MLP norm output, so shifting
    /// their biases is equivalent to shifting that output.
    pub fn input_projections_mut(&mut self) -> Vec<&mut Linear> {
        match &mut self.variant {
            MlpVariant::GatedSeparate {
                gate_proj, up_proj, ..
            } => vec![gate_proj, up_proj],
            MlpVariant::GatedFused { gate_up_proj, .. } => vec![gate_up_proj],
            MlpVariant::Plain { fc, .. } => vec![fc],
        }
    }

    /// Run the feed-forward block.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = match &self.variant {
            MlpVariant::GatedSeparate {
                gate_proj,
                up_proj,
                down_proj,
            } => {
                let gate = activate(&gate_proj.forward(x)?, self.activation)?;
                down_proj.forward(&(gate * up_proj.forward(x)?)?)?
            }
            MlpVariant::GatedFused {
                gate_up_proj,
                down_proj,
                intermediate_size,
            } => {
                let gate_up = gate_up_proj.forward(x)?;
                let gate = gate_up.narrow(D::Minus1, 0, *intermediate_size)?;
                let up = gate_up.narrow(D::Minus1, *intermediate_size, *intermediate_size)?;
                down_proj.forward(&(activate(&gate, self.activation)? * up)?)?
            }
            MlpVariant::Plain { fc, proj } => {
                proj.forward(&activate(&fc.forward(x)?, self.activation)?)?
            }
        };
        Ok(out)
    }
}

/// Apply the configured activation.
fn activate(x: &Tensor, activation: Activation) -> Result<Tensor> {
    let out = match activation {
        Activation::Silu => candle_nn::ops::silu(x)?,
        Activation::Gelu => x.gelu_erf()?,
        Activation::GeluApprox => x.gelu()?,
    };
    Ok(out)
}
