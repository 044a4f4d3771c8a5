// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scope-bound capture and edit of one hook point.
//!
//! A [`Trace`] attaches an observer (optionally an editor) to a hook point
//! and keeps the most recent value seen there.  It detaches when dropped.

use std::sync::{Arc, Mutex};

use candle_core::Tensor;

use super::{HookFn, HookHandle, HookPoint, HookRegistry, HookValue};
use crate::error::{Result, SteerError};

/// Options for [`SteerModel::trace_with`](crate::SteerModel::trace_with).
#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Keep a copy of the last value seen at the point.
    pub retain_output: bool,
    /// Rewrite the value before it flows downstream.
    pub edit_output: Option<HookFn>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            retain_output: true,
            edit_output: None,
        }
    }
}

/// Slot holding the last retained value.
type Slot = Arc<Mutex<Option<HookValue>>>;

/// An active trace on one hook point.
///
/// Every forward evaluation while the trace is alive runs the edit function
/// (if any) and then overwrites the retained value.  Retained tensors are
/// immutable snapshots, so two traces never share state.
///
/// ```no_run
/// # fn demo(model: &candle_steer::SteerModel, ids: &candle_core::Tensor) -> candle_steer::Result<()> {
/// use candle_steer::{HookPoint, HookSpec};
///
/// let trace = model.trace(HookPoint::ResidPost(6))?;
/// model.forward(ids, &HookSpec::new())?;
/// let hidden = trace.output()?; // [batch, seq, hidden]
/// # let _ = hidden; Ok(())
/// # }
/// ```
#[must_use = "dropping a Trace immediately detaches it"]
#[derive(Debug)]
pub struct Trace {
    /// Registry attachment; detaches on drop.
    handle: HookHandle,
    /// Last retained value.
    slot: Slot,
}

impl Trace {
    /// Attach a trace at `point`.
    pub(crate) fn attach(
        registry: &Arc<HookRegistry>,
        point: HookPoint,
        options: TraceOptions,
    ) -> Result<Self> {
        let slot: Slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        let TraceOptions {
            retain_output,
            edit_output,
        } = options;

        let hook = HookFn::new(move |point, value| {
            let value = match &edit_output {
                Some(edit) => edit.call(point, value)?,
                None => value,
            };
            if retain_output {
                *lock_slot(&sink)? = Some(value.clone());
            }
            Ok(value)
        });

        let handle = HookHandle::attach(registry, point, hook)?;
        Ok(Self { handle, slot })
    }

    /// The traced hook point.
    pub const fn point(&self) -> &HookPoint {
        self.handle.point()
    }

    /// The last retained value, packaged as the point produces it.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if nothing has been retained yet.
    pub fn value(&self) -> Result<HookValue> {
        lock_slot(&self.slot)?.clone().ok_or_else(|| {
            SteerError::Hook(format!(
                "trace at `{}` has not seen a forward pass yet",
                self.point()
            ))
        })
    }

    /// The last retained tensor of interest (unpacked for block outputs).
    ///
    /// # Shapes
    /// - returns: `[batch, seq, ...]` as seen in the most recent evaluation
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if nothing has been retained yet.
    pub fn output(&self) -> Result<Tensor> {
        Ok(self.value()?.into_tensor())
    }

    /// Detach and return the last retained value.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the registry or slot lock is poisoned.
    pub fn stop(self) -> Result<Option<HookValue>> {
        let Self { handle, slot } = self;
        handle.remove()?;
        let retained = lock_slot(&slot)?.take();
        Ok(retained)
    }
}

/// Lock a trace slot.
fn lock_slot(slot: &Slot) -> Result<std::sync::MutexGuard<'_, Option<HookValue>>> {
    slot.lock()
        .map_err(|_| SteerError::Hook("trace slot lock poisoned".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
