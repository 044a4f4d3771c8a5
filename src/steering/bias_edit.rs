// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering folded into projection biases.
//!
//! Adding `s` to an activation that only feeds `y = W x + b` is the same as
//! replacing `b` with `b + W s`.  [`BiasEdit`] makes that replacement for
//! the lifetime of the guard and restores the saved biases afterwards.

use std::ops::Deref;

use crate::backend::{BiasSnapshot, SteerModel};
use crate::error::{Result, SteerError};
use crate::hooks::HookPoint;

use super::{SteeringVector, check_target};

/// Guard for an active bias edit.
///
/// Dereferences to the edited [`SteerModel`], so forward passes and
/// generation run through it.  It borrows the model mutably, so edits
/// cannot stack.  Dropping it restores the original biases.
///
/// ```no_run
/// # fn demo(model: &mut candle_steer::SteerModel, v: &candle_steer::SteeringVector) -> candle_steer::Result<()> {
/// use candle_steer::{GenerationConfig, HookPoint, HookSpec};
///
/// let edited = model.edit_bias(HookPoint::MlpNorm(6), v, 4.0)?;
/// let ids = edited.generate(&[464, 3290], &GenerationConfig::default(), &HookSpec::new())?;
/// edited.restore()?;
/// # let _ = ids; Ok(())
/// # }
/// ```
#[must_use = "dropping a BiasEdit immediately restores the original biases"]
pub struct BiasEdit<'a> {
    /// Edited model.
    model: &'a mut SteerModel,
    /// Saved biases; `None` once restored.
    snapshot: Option<BiasSnapshot>,
}

impl<'a> BiasEdit<'a> {
    /// Fold `coefficient * vector` into the projections reading `point`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`](crate::SteerError::Steering) if the
    /// point is not read only by affine projections, or the width differs.
    pub(crate) fn apply(
        model: &'a mut SteerModel,
        point: HookPoint,
        vector: &SteeringVector,
        coefficient: f64,
    ) -> Result<Self> {
        check_target(model.hidden_size(), &point, vector)?;
        let shift = vector.scaled(coefficient)?.flatten_all()?;
        let snapshot = model.backend_mut().shift_input_bias(&point, &shift)?;
        if snapshot.is_empty() {
            return Err(SteerError::Steering(format!(
                "no projection reads `{point}`, nothing to edit"
            )));
        }
        tracing::debug!(
            %point,
            coefficient,
            projections = snapshot.len(),
            "bias edit applied"
        );
        Ok(Self {
            model,
            snapshot: Some(snapshot),
        })
    }

    /// The edited hook point, while the edit is active.
    #[must_use]
    pub fn point(&self) -> Option<&HookPoint> {
        self.snapshot.as_ref().map(BiasSnapshot::point)
    }

    /// Restore the original biases now, reporting failures.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`](crate::SteerError::Steering) if the
    /// saved biases no longer fit the model.
    pub fn restore(mut self) -> Result<()> {
        self.restore_saved()
    }

    /// Put the snapshot back, once.
    fn restore_saved(&mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            let point = snapshot.point().clone();
            self.model.backend_mut().restore_input_bias(snapshot)?;
            tracing::debug!(%point, "bias edit restored");
        }
        Ok(())
    }
}

impl Deref for BiasEdit<'_> {
    type Target = SteerModel;

    fn deref(&self) -> &SteerModel {
        &*self.model
    }
}

impl Drop for BiasEdit<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore_saved() {
            tracing::error!("failed to restore biases: {e}");
        }
    }
}

impl std::fmt::Debug for BiasEdit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiasEdit")
            .field("point", &self.point())
            .finish_non_exhaustive()
    }
}
