// SPDX-License-Identifier: MIT OR Apache-2.0

//! Coefficient sweeps.
//!
//! A sweep generates one baseline completion and one steered completion
//! per coefficient, and measures how far each coefficient moves the
//! next-token distribution at the end of the prompt.

use candle_core::{DType, Tensor};

use crate::backend::SteerModel;
use crate::error::Result;
use crate::generation::GenerationConfig;
use crate::hooks::{HookPoint, HookSpec};
use crate::tokenizer::SteerTokenizer;

use super::SteeringVector;

/// Standard coefficients for sweeps: symmetric around zero, doubling.
pub const STANDARD_COEFFICIENTS: [f64; 7] = [-8.0, -4.0, -2.0, 0.0, 2.0, 4.0, 8.0];

/// One steered completion.
#[derive(Debug, Clone)]
pub struct SweepPoint {
    /// Injection coefficient.
    pub coefficient: f64,
    /// Generated token IDs.
    pub tokens: Vec<u32>,
    /// Decoded generated text.
    pub text: String,
    /// `KL(baseline || steered)` of the next-token distribution after the prompt.
    pub kl_divergence: f32,
}

/// Steered completions of one prompt over a range of coefficients.
#[derive(Debug, Clone)]
pub struct CoefficientSweep {
    /// Prompt text.
    pub prompt: String,
    /// Injection point.
    pub point: HookPoint,
    /// Unsteered generated token IDs.
    pub baseline_tokens: Vec<u32>,
    /// Unsteered generated text.
    pub baseline_text: String,
    /// One entry per coefficient, in input order.
    pub points: Vec<SweepPoint>,
}

impl CoefficientSweep {
    /// Run the sweep.
    ///
    /// Each coefficient is injected at `point` for the duration of its own
    /// generation only.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer, injection and generation errors.
    pub fn run(
        model: &SteerModel,
        tokenizer: &SteerTokenizer,
        prompt: &str,
        point: &HookPoint,
        vector: &SteeringVector,
        coefficients: &[f64],
        config: &GenerationConfig,
    ) -> Result<Self> {
        let prompt_ids = tokenizer.encode(prompt)?;
        let no_hooks = HookSpec::new();

        let baseline_logits = model.next_token_logits(&prompt_ids, &no_hooks)?;
        let baseline_tokens = model.generate(&prompt_ids, config, &no_hooks)?;
        let baseline_text = tokenizer.decode(&baseline_tokens)?;

        let mut points = Vec::with_capacity(coefficients.len());
        for &coefficient in coefficients {
            let (logits, tokens) = model.with_injection(point.clone(), vector, coefficient, |m| {
                Ok((
                    m.next_token_logits(&prompt_ids, &no_hooks)?,
                    m.generate(&prompt_ids, config, &no_hooks)?,
                ))
            })?;
            let kl = kl_divergence(&baseline_logits, &logits)?;
            tracing::debug!(%point, coefficient, kl, "sweep point");
            points.push(SweepPoint {
                coefficient,
                text: tokenizer.decode(&tokens)?,
                tokens,
                kl_divergence: kl,
            });
        }

        Ok(Self {
            prompt: prompt.to_owned(),
            point: point.clone(),
            baseline_tokens,
            baseline_text,
            points,
        })
    }

    /// The entry for `coefficient`, if it was swept.
    #[must_use]
    pub fn point_for(&self, coefficient: f64) -> Option<&SweepPoint> {
        self.points
            .iter()
            .find(|p| (p.coefficient - coefficient).abs() < f64::EPSILON)
    }

    /// Entries whose generation differs from the baseline.
    pub fn changed_points(&self) -> impl Iterator<Item = &SweepPoint> {
        self.points
            .iter()
            .filter(move |p| p.tokens != self.baseline_tokens)
    }
}

/// `KL(P || Q)` where `P = softmax(baseline)`, `Q = softmax(other)`.
///
/// Terms where either probability is below `1e-10` are skipped.
///
/// # Errors
///
/// Returns [`SteerError::Model`](crate::SteerError::Model) if tensor
/// operations fail.
pub fn kl_divergence(baseline_logits: &Tensor, other_logits: &Tensor) -> Result<f32> {
    let p = softmax_to_vec(baseline_logits)?;
    let q = softmax_to_vec(other_logits)?;

    Ok(p.iter()
        .zip(q.iter())
        .filter(|&(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum())
}

/// Softmax over the last dimension, flattened.
fn softmax_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    // PROMOTE: softmax needs f32 for numerical stability
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    Ok(probs.flatten_all()?.to_vec1()?)
}
