// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generation settings, token sampling and generation results.
//!
//! The decoding loop itself lives on [`SteerModel::generate`](crate::SteerModel::generate);
//! this module holds what it is configured with and what it returns.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, SteerError};

// ---------------------------------------------------------------------------
// GenerationConfig
// ---------------------------------------------------------------------------

/// How the next token is picked from the logits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodingMode {
    /// Argmax.
    Greedy,
    /// Temperature-scaled softmax sampling.
    ///
    /// A `temperature <= 0.0` falls back to argmax.  A fixed `seed` makes
    /// the run reproducible.
    Sample {
        /// Softmax temperature.
        temperature: f32,
        /// RNG seed; `None` seeds from the OS.
        seed: Option<u64>,
    },
}

/// Settings for [`SteerModel::generate`](crate::SteerModel::generate).
///
/// ```
/// use candle_steer::{DecodingMode, GenerationConfig};
///
/// let config = GenerationConfig {
///     max_new_tokens: 32,
///     decoding: DecodingMode::Sample { temperature: 0.7, seed: Some(42) },
///     ..GenerationConfig::default()
/// };
/// assert_eq!(config.eos_token_id, None);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens.
    pub max_new_tokens: usize,
    /// Stop after emitting this token (it is kept in the output).
    pub eos_token_id: Option<u32>,
    /// Next-token selection.
    pub decoding: DecodingMode,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            eos_token_id: None,
            decoding: DecodingMode::Greedy,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding of up to `max_new_tokens` tokens.
    #[must_use]
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Self::default()
        }
    }

    /// Stop at `eos_token_id`.
    #[must_use]
    pub const fn with_eos(mut self, eos_token_id: Option<u32>) -> Self {
        self.eos_token_id = eos_token_id;
        self
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Next-token picker for one generation run.
pub(crate) struct Sampler {
    /// Temperature, or `None` for argmax.
    temperature: Option<f32>,
    /// RNG for sampling runs.
    rng: StdRng,
}

impl Sampler {
    /// Build a sampler for `mode`.
    pub(crate) fn new(mode: DecodingMode) -> Self {
        match mode {
            DecodingMode::Sample { temperature, seed } if temperature > 0.0 => Self {
                temperature: Some(temperature),
                rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            },
            DecodingMode::Greedy | DecodingMode::Sample { .. } => Self {
                temperature: None,
                rng: StdRng::seed_from_u64(0),
            },
        }
    }

    /// Pick the next token.
    ///
    /// # Shapes
    /// - `logits`: `[vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if the logits are empty or cannot be
    /// read as `f32`.
    pub(crate) fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        match self.temperature {
            None => argmax(logits),
            Some(temperature) => sample_with_temperature(logits, temperature, &mut self.rng),
        }
    }
}

/// Read logits as a flat `f32` vector.
fn logits_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    // PROMOTE: comparisons and softmax run in f32
    let values: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    // NaN never wins or loses a comparison, so reject it outright.
    if let Some(idx) = values.iter().position(|v| v.is_nan()) {
        return Err(SteerError::Model(candle_core::Error::Msg(format!(
            "NaN logit at index {idx}"
        ))));
    }
    Ok(values)
}

/// Greedy (argmax) sampling.  Ties resolve to the lowest index.
pub(crate) fn argmax(logits: &Tensor) -> Result<u32> {
    let values = logits_to_vec(logits)?;

    let mut best: Option<(usize, f32)> = None;
    for (idx, &v) in values.iter().enumerate() {
        if best.is_none_or(|(_, b)| v > b) {
            best = Some((idx, v));
        }
    }
    let (idx, _) =
        best.ok_or_else(|| SteerError::Model(candle_core::Error::Msg("empty logits".into())))?;

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    Ok(idx as u32)
}

/// Temperature-scaled softmax sampling.
fn sample_with_temperature(logits: &Tensor, temperature: f32, rng: &mut StdRng) -> Result<u32> {
    let values = logits_to_vec(logits)?;
    if values.is_empty() {
        return Err(SteerError::Model(candle_core::Error::Msg("empty logits".into())));
    }

    // Numerically stable softmax.
    let scaled: Vec<f32> = values.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rng.r#gen::<f32>() * sum;
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e;
        if r < cumsum {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            return Ok(idx as u32);
        }
    }

    // Floating-point rounding can leave r at the very top.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    Ok((exp_vals.len() - 1) as u32)
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// Output of [`SteerModel::complete`](crate::SteerModel::complete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// Original prompt text.
    pub prompt: String,
    /// Decoded prompt followed by the generated tokens.
    pub full_text: String,
    /// Only the generated portion.
    pub generated_text: String,
    /// Token IDs from the prompt.
    pub prompt_tokens: Vec<u32>,
    /// Token IDs that were generated.
    pub generated_tokens: Vec<u32>,
    /// Total token count (prompt + generated).
    pub total_tokens: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn argmax_prefers_first_of_ties() {
        let logits = Tensor::new(&[0.5_f32, 2.0, 2.0, -1.0], &Device::Cpu).unwrap();
        assert_eq!(argmax(&logits).unwrap(), 1);
    }

    #[test]
    fn argmax_of_empty_logits_errors() {
        let logits = Tensor::new(&[] as &[f32], &Device::Cpu).unwrap();
        assert!(argmax(&logits).is_err());
    }

    #[test]
    fn nan_logits_are_rejected() {
        let logits = Tensor::new(&[f32::NAN, 2.0, 1.0], &Device::Cpu).unwrap();
        assert!(matches!(argmax(&logits), Err(SteerError::Model(_))));

        let later = Tensor::new(&[0.5_f32, 2.0, f32::NAN], &Device::Cpu).unwrap();
        assert!(argmax(&later).is_err());
        let mut sampler = Sampler::new(DecodingMode::Sample {
            temperature: 1.0,
            seed: Some(3),
        });
        assert!(sampler.sample(&later).is_err());
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let logits = Tensor::new(&[1.0_f32, 1.1, 0.9, 1.05, 0.3], &Device::Cpu).unwrap();
        let mode = DecodingMode::Sample {
            temperature: 1.0,
            seed: Some(7),
        };
        let mut a = Sampler::new(mode);
        let mut b = Sampler::new(mode);
        let run_a: Vec<u32> = (0..16).map(|_| a.sample(&logits).unwrap()).collect();
        let run_b: Vec<u32> = (0..16).map(|_| b.sample(&logits).unwrap()).collect();
        assert_eq!(run_a, run_b);
        assert!(run_a.iter().all(|&t| t < 5));
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let logits = Tensor::new(&[0.0_f32, 3.0, 1.0], &Device::Cpu).unwrap();
        let mut sampler = Sampler::new(DecodingMode::Sample {
            temperature: 0.0,
            seed: None,
        });
        assert_eq!(sampler.sample(&logits).unwrap(), 1);
    }

    #[test]
    fn sharp_distribution_samples_its_peak() {
        let logits = Tensor::new(&[0.0_f32, 50.0, 0.0], &Device::Cpu).unwrap();
        let mut sampler = Sampler::new(DecodingMode::Sample {
            temperature: 1.0,
            seed: Some(1),
        });
        for _ in 0..8 {
            assert_eq!(sampler.sample(&logits).unwrap(), 1);
        }
    }

    #[test]
    fn default_config_is_greedy_twenty_tokens() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_new_tokens, 20);
        assert_eq!(config.decoding, DecodingMode::Greedy);
        assert_eq!(GenerationConfig::greedy(5).with_eos(Some(2)).eos_token_id, Some(2));
    }
}
