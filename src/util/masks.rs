// SPDX-License-Identifier: MIT OR Apache-2.0

//! Additive attention masks for full-sequence and KV-cached forward passes.
//!
//! Masks hold `0.0` where a query may attend and `-inf` elsewhere, and are
//! added to the attention scores before softmax.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Create a causal mask for `seq_len` new queries over `kv_len` keys.
///
/// The queries sit at absolute positions `offset..offset + seq_len`; keys
/// cover `0..kv_len` (cached positions first).  Query `i` may attend key
/// `j` when `j <= offset + i` and, with a sliding window `w`, when
/// `offset + i - j < w`.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, kv_len]`
///
/// # Example
///
/// For `seq_len = 2`, `kv_len = 4`, `offset = 2`, no window:
/// ```text
/// [[[[0, 0, 0, -inf],
///    [0, 0, 0,    0]]]]
/// ```
///
/// # Errors
///
/// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor creation failure.
pub fn create_causal_mask(
    seq_len: usize,
    kv_len: usize,
    offset: usize,
    window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            let pos = offset + i;
            (0..kv_len).map(move |j| {
                let future = j > pos;
                let outside_window = window.is_some_and(|w| pos - j.min(pos) >= w);
                if future || outside_window {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, kv_len), device)?.to_dtype(dtype)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn rows(mask: &Tensor) -> Vec<Vec<f32>> {
        mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap()
    }

    #[test]
    fn full_sequence_is_lower_triangular() {
        let mask = create_causal_mask(3, 3, 0, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let m = rows(&mask);
        assert_eq!(m[0][0], 0.0);
        assert!(m[0][1].is_infinite() && m[0][1] < 0.0);
        assert_eq!(m[1][1], 0.0);
        assert!(m[1][2].is_infinite());
        assert!(m[2].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn single_decode_step_sees_whole_cache() {
        let mask = create_causal_mask(1, 5, 4, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 1, 5]);
        assert!(rows(&mask)[0].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn offset_chunk_over_cache() {
        let mask = create_causal_mask(2, 4, 2, None, &Device::Cpu, DType::F32).unwrap();
        let m = rows(&mask);
        assert_eq!(&m[0][..3], &[0.0, 0.0, 0.0]);
        assert!(m[0][3].is_infinite());
        assert!(m[1].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn sliding_window_drops_old_keys() {
        let mask = create_causal_mask(4, 4, 0, Some(2), &Device::Cpu, DType::F32).unwrap();
        let m = rows(&mask);
        // Query 3 sees keys 2 and 3 only.
        assert!(m[3][0].is_infinite());
        assert!(m[3][1].is_infinite());
        assert_eq!(m[3][2], 0.0);
        assert_eq!(m[3][3], 0.0);
    }
}
