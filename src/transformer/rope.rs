// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary position embeddings (`RoPE`).
//!
//! `cos`/`sin` tables are computed once at load; [`RopeCache::apply`]
//! rotates query and key tensors at an absolute position offset so that
//! KV-cached decoding steps see the same encoding as a full pass.

use candle_core::{D, DType, Device, Tensor};

use crate::error::{Result, SteerError};

/// Pre-computed cosine and sine tables.
pub struct RopeCache {
    /// `[max_position, head_dim / 2]`.
    cos: Tensor,
    /// `[max_position, head_dim / 2]`.
    sin: Tensor,
}

impl RopeCache {
    /// Build the tables for positions `0..max_position`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures.
    pub fn new(
        head_dim: usize,
        max_position: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let half_dim = head_dim / 2;

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::as_conversions
        )]
        // PROMOTE: frequencies in f64, stored as f32 like the reference tables
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions = Tensor::arange(0_u32, u32::try_from(max_position).map_err(|_| {
            SteerError::Config(format!("max_position {max_position} overflows u32"))
        })?, device)?
        .to_dtype(DType::F32)?
        .reshape((max_position, 1))?;

        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate `x` for positions `start_pos..start_pos + seq_len`.
    ///
    /// # Shapes
    /// - `x`: `[batch, n_heads, seq_len, head_dim]`
    /// - returns: same shape
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if the positions run past the table,
    /// or [`SteerError::Model`] on tensor failures.
    pub fn apply(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        let max_position = self.cos.dim(0)?;
        if start_pos + seq_len > max_position {
            return Err(SteerError::Config(format!(
                "position {} exceeds the rotary table ({max_position} positions)",
                start_pos + seq_len
            )));
        }
        let half_dim = head_dim / 2;

        let cos = self.cos.narrow(0, start_pos, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        // [x1*cos - x2*sin, x1*sin + x2*cos]
        let r1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let r2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Ok(Tensor::cat(&[&r1, &r2], D::Minus1)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn offset_matches_full_sequence_slice() {
        let rope = RopeCache::new(4, 16, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::arange(0_f32, 24.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 6, 4))
            .unwrap();
        let full = rope.apply(&x, 0).unwrap();
        let tail = rope.apply(&x.narrow(2, 4, 2).unwrap(), 4).unwrap();
        let a: Vec<f32> = full.narrow(2, 4, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = tail.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn position_zero_is_identity() {
        let rope = RopeCache::new(4, 8, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::new(&[[[[1.0_f32, 2.0, 3.0, 4.0]]]], &Device::Cpu).unwrap();
        let y: Vec<f32> = rope.apply(&x, 0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn past_the_table_errors() {
        let rope = RopeCache::new(4, 8, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::zeros((1, 1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(rope.apply(&x, 7).is_err());
    }
}
