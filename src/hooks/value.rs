// SPDX-License-Identifier: MIT OR Apache-2.0

//! Values flowing through hook points, and user callbacks over them.

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use super::{HookPoint, OutputKind};
use crate::error::Result;

// ---------------------------------------------------------------------------
// HookValue
// ---------------------------------------------------------------------------

/// The value produced at a hook point.
///
/// Most points produce a bare tensor. A decoder block produces a pair:
/// the hidden state and the block's present key/value tensors.  Callbacks
/// that modify a block output must hand back the same pair shape; use
/// [`map_tensor`](Self::map_tensor) to edit the hidden state and re-pair it.
///
/// # Shapes
/// - `Tensor`: `[batch, seq, ...]`, point-dependent
/// - `Block::hidden`: `[batch, seq, hidden_size]`
/// - `Block::present`: two `[batch, num_kv_heads, total_seq, head_dim]` tensors
#[derive(Debug, Clone)]
pub enum HookValue {
    /// A bare activation tensor.
    Tensor(Tensor),
    /// A decoder block output.
    Block {
        /// Hidden state leaving the block.
        hidden: Tensor,
        /// Present keys and values of the block's attention.
        present: (Tensor, Tensor),
    },
}

impl HookValue {
    /// The tensor of interest (the hidden state for block outputs).
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        match self {
            Self::Tensor(t) | Self::Block { hidden: t, .. } => t,
        }
    }

    /// Consume the value and keep only the tensor of interest.
    #[must_use]
    pub fn into_tensor(self) -> Tensor {
        match self {
            Self::Tensor(t) | Self::Block { hidden: t, .. } => t,
        }
    }

    /// Present key/value pair, for block outputs.
    #[must_use]
    pub const fn present(&self) -> Option<&(Tensor, Tensor)> {
        match self {
            Self::Tensor(_) => None,
            Self::Block { present, .. } => Some(present),
        }
    }

    /// Packaging of this value.
    #[must_use]
    pub const fn kind(&self) -> OutputKind {
        match self {
            Self::Tensor(_) => OutputKind::Tensor,
            Self::Block { .. } => OutputKind::Block,
        }
    }

    /// Transform the tensor of interest, keeping the packaging.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`.
    pub fn map_tensor<F>(self, f: F) -> Result<Self>
    where
        F: FnOnce(Tensor) -> Result<Tensor>,
    {
        match self {
            Self::Tensor(t) => Ok(Self::Tensor(f(t)?)),
            Self::Block { hidden, present } => Ok(Self::Block {
                hidden: f(hidden)?,
                present,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// HookFn
// ---------------------------------------------------------------------------

/// Signature of a hook callback.
type HookCallback = dyn Fn(&HookPoint, HookValue) -> Result<HookValue> + Send + Sync;

/// A shareable callback run at a hook point.
///
/// The callback receives the packaged value and returns the value that
/// flows downstream.  Returning the input unchanged makes it an observer.
///
/// ```
/// use candle_steer::{HookFn, HookValue};
///
/// let double = HookFn::new(|_point, value: HookValue| {
///     value.map_tensor(|t| Ok((t * 2.0)?))
/// });
/// # let _ = double;
/// ```
#[derive(Clone)]
pub struct HookFn(Arc<HookCallback>);

impl HookFn {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&HookPoint, HookValue) -> Result<HookValue> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a read-only closure; the value passes through unchanged.
    pub fn observer<F>(f: F) -> Self
    where
        F: Fn(&HookPoint, &HookValue) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(move |point, value| {
            f(point, &value)?;
            Ok(value)
        })
    }

    /// Invoke the callback.
    ///
    /// # Errors
    ///
    /// Propagates the callback's error.
    pub fn call(&self, point: &HookPoint, value: HookValue) -> Result<HookValue> {
        (self.0)(point, value)
    }
}

impl fmt::Debug for HookFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HookFn").field(&"<callback>").finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
