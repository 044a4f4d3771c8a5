// SPDX-License-Identifier: MIT OR Apache-2.0

//! KV-cache for autoregressive generation.
//!
//! Each decoder block returns its present keys and values (cached positions
//! followed by the new ones) as part of its output pair.  The forward pass
//! writes that pair back here, so a hook that rewrites a block output also
//! decides what later decoding steps attend to.
//!
//! ## Memory layout
//!
//! Each layer stores:
//! - keys: `[batch, num_kv_heads, seq_len, head_dim]`
//! - values: `[batch, num_kv_heads, seq_len, head_dim]`
//!
//! GPT-2 small at 1024 tokens in F32: 12 layers * 2 * 12 heads * 64 * 1024
//! * 4 bytes = ~72 MB.

use candle_core::Tensor;

use crate::error::{Result, SteerError};

/// Per-layer key/value cache.
///
/// # Shapes
///
/// - keys: `[batch, num_kv_heads, seq_len, head_dim]`
/// - values: `[batch, num_kv_heads, seq_len, head_dim]`
#[derive(Debug, Clone, Default)]
pub struct KVCache {
    /// Cached `(keys, values)` per layer.
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KVCache {
    /// Create an empty cache for `n_layers` layers.
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: vec![None; n_layers],
        }
    }

    /// Number of cached positions (0 if empty).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if a cached tensor is not rank 4.
    pub fn seq_len(&self) -> Result<usize> {
        match self.layers.iter().find_map(Option::as_ref) {
            Some((k, _)) => Ok(k.dim(2)?),
            None => Ok(0),
        }
    }

    /// Whether no layer has been populated.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Option::is_none)
    }

    /// Number of layers in the cache.
    pub const fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Drop every cached tensor.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            *layer = None;
        }
    }

    /// Cached keys and values for `layer`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if `layer` is out of range.
    pub fn layer(&self, layer: usize) -> Result<Option<&(Tensor, Tensor)>> {
        self.layers
            .get(layer)
            .map(Option::as_ref)
            .ok_or_else(|| SteerError::Hook(format!("layer {layer} out of range for KV cache")))
    }

    /// Overwrite the entry for `layer` with the block's present pair.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if `layer` is out of range.
    pub fn set_layer(&mut self, layer: usize, present: (Tensor, Tensor)) -> Result<()> {
        let slot = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| SteerError::Hook(format!("layer {layer} out of range for KV cache")))?;
        *slot = Some(present);
        Ok(())
    }

    /// Total bytes held by cached tensors.
    pub fn memory_usage(&self) -> usize {
        self.layers
            .iter()
            .flatten()
            .map(|(k, v)| {
                k.elem_count() * k.dtype().size_in_bytes()
                    + v.elem_count() * v.dtype().size_in_bytes()
            })
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
