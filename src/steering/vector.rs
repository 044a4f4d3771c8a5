// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering vectors from contrastive activations.

use candle_core::{DType, Tensor};

use crate::backend::SteerModel;
use crate::error::{Result, SteerError};
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::tokenizer::SteerTokenizer;

/// A unit-norm steering direction.
///
/// Built from the last sequence position of two activations captured at
/// the same hook point:
/// `direction = (positive - negative) / ||positive - negative||`.
///
/// # Shapes
/// - `direction`: `[1, 1, hidden_size]`, `F32`, broadcastable over
///   `[batch, seq, hidden_size]`
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_steer::{HookPoint, SteeringVector};
///
/// let pos = Tensor::new(&[[[0.0_f32, 3.0], [3.0, 4.0]]], &Device::Cpu).unwrap();
/// let neg = Tensor::new(&[[[0.0_f32, 0.0]]], &Device::Cpu).unwrap();
/// let v = SteeringVector::from_activations(HookPoint::ResidPost(0), &pos, &neg).unwrap();
/// assert!((v.raw_norm() - 5.0).abs() < 1e-6);
/// let d = v.to_vec().unwrap();
/// assert!((d[0] - 0.6).abs() < 1e-6 && (d[1] - 0.8).abs() < 1e-6);
/// ```
#[derive(Debug, Clone)]
pub struct SteeringVector {
    /// Point the activations were captured at.
    point: HookPoint,
    /// Unit-norm direction.
    direction: Tensor,
    /// Norm of the difference before normalization.
    raw_norm: f32,
}

impl SteeringVector {
    /// Derive a vector from two captured activations.
    ///
    /// Sequence lengths may differ; only the last position of each is used.
    ///
    /// # Shapes
    /// - `positive`, `negative`: `[1, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if either input is not
    /// `[1, seq >= 1, hidden]`, the hidden sizes differ, or the two last
    /// positions are identical.
    pub fn from_activations(point: HookPoint, positive: &Tensor, negative: &Tensor) -> Result<Self> {
        let pos = last_position(positive, "positive")?;
        let neg = last_position(negative, "negative")?;
        if pos.dims() != neg.dims() {
            return Err(SteerError::Steering(format!(
                "contrastive activations have different widths: {:?} vs {:?}",
                pos.dims(),
                neg.dims()
            )));
        }
        // PROMOTE: difference and norm in F32
        let diff = (pos.to_dtype(DType::F32)? - neg.to_dtype(DType::F32)?.to_device(pos.device())?)?;
        Self::normalized(point, diff)
    }

    /// Normalize an arbitrary direction, e.g. one loaded from disk.
    ///
    /// # Shapes
    /// - `direction`: `[hidden_size]` or any shape with `hidden_size` elements
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if the direction is zero.
    pub fn from_direction(point: HookPoint, direction: &Tensor) -> Result<Self> {
        let flat = direction.to_dtype(DType::F32)?.flatten_all()?;
        let hidden = flat.dim(0)?;
        Self::normalized(point, flat.reshape((1, 1, hidden))?)
    }

    /// Capture `positive` and `negative` prompts at `point` and derive the
    /// vector from their last positions.
    ///
    /// Each prompt runs in its own forward pass under its own scoped trace.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if `point` does not carry a
    /// hidden-size activation or the prompts give identical activations,
    /// and propagates tokenizer and forward errors.
    pub fn derive(
        model: &SteerModel,
        tokenizer: &SteerTokenizer,
        point: HookPoint,
        positive: &str,
        negative: &str,
    ) -> Result<Self> {
        if !point.is_hidden_width() {
            return Err(SteerError::Steering(format!(
                "`{point}` does not carry a hidden-size activation"
            )));
        }
        let capture = |text: &str| -> Result<Tensor> {
            let input = model.input_tensor(&tokenizer.encode(text)?)?;
            let trace = model.trace(point.clone())?;
            model.forward(&input, &HookSpec::new())?;
            let out = trace.output()?;
            trace.stop()?;
            Ok(out)
        };
        let pos = capture(positive)?;
        let neg = capture(negative)?;
        let vector = Self::from_activations(point, &pos, &neg)?;
        tracing::debug!(
            point = %vector.point,
            raw_norm = vector.raw_norm,
            hidden = vector.hidden_size(),
            "steering vector derived"
        );
        Ok(vector)
    }

    /// Divide `diff` by its Euclidean norm.
    fn normalized(point: HookPoint, diff: Tensor) -> Result<Self> {
        let raw_norm: f32 = diff.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
        if !raw_norm.is_finite() || raw_norm == 0.0 {
            return Err(SteerError::Steering(
                "the two contrastive activations are identical".into(),
            ));
        }
        let direction = (diff / f64::from(raw_norm))?;
        Ok(Self {
            point,
            direction,
            raw_norm,
        })
    }

    /// The unit-norm direction.
    ///
    /// # Shapes
    /// - returns: `[1, 1, hidden_size]`
    #[must_use]
    pub const fn direction(&self) -> &Tensor {
        &self.direction
    }

    /// Width of the direction.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.direction.elem_count()
    }

    /// Point the source activations were captured at.
    #[must_use]
    pub const fn hook_point(&self) -> &HookPoint {
        &self.point
    }

    /// Norm of the activation difference before normalization.
    #[must_use]
    pub const fn raw_norm(&self) -> f32 {
        self.raw_norm
    }

    /// `coefficient * direction`.
    ///
    /// # Shapes
    /// - returns: `[1, 1, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures.
    pub fn scaled(&self, coefficient: f64) -> Result<Tensor> {
        Ok((&self.direction * coefficient)?)
    }

    /// The direction as a flat `Vec`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.direction.flatten_all()?.to_vec1()?)
    }

    /// An [`Intervention::Add`] of `coefficient * direction` for a
    /// [`HookSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures.
    pub fn intervention(&self, coefficient: f64) -> Result<Intervention> {
        Ok(Intervention::Add(self.scaled(coefficient)?))
    }
}

/// Last sequence position of a `[1, seq, hidden]` activation.
///
/// # Shapes
/// - `activation`: `[1, seq, hidden]`
/// - returns: `[1, 1, hidden]`
fn last_position(activation: &Tensor, label: &str) -> Result<Tensor> {
    match *activation.dims() {
        [1, seq_len, _] if seq_len > 0 => Ok(activation.narrow(1, seq_len - 1, 1)?),
        ref dims => Err(SteerError::Steering(format!(
            "{label} activation must be [1, seq >= 1, hidden], got {dims:?}"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn norm_of(t: &Tensor) -> f32 {
        t.sqr().unwrap().sum_all().unwrap().sqrt().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn derived_vector_has_unit_norm() {
        let pos = Tensor::new(&[[[0.3_f32, -1.2, 2.5, 0.0], [1.0, 2.0, 3.0, 4.0]]], &Device::Cpu)
            .unwrap();
        let neg = Tensor::new(&[[[4.0_f32, 0.5, -1.0, 2.0]]], &Device::Cpu).unwrap();
        let v = SteeringVector::from_activations(HookPoint::ResidPost(2), &pos, &neg).unwrap();
        assert!((norm_of(v.direction()) - 1.0).abs() < 1e-5);
        assert_eq!(v.direction().dims(), &[1, 1, 4]);
        assert_eq!(v.hidden_size(), 4);
        assert_eq!(v.hook_point(), &HookPoint::ResidPost(2));
    }

    #[test]
    fn only_last_positions_matter() {
        let pos = Tensor::new(&[[[9.0_f32, 9.0], [1.0, 0.0]]], &Device::Cpu).unwrap();
        let neg = Tensor::new(&[[[-5.0_f32, 7.0], [0.0, 0.0]]], &Device::Cpu).unwrap();
        let v = SteeringVector::from_activations(HookPoint::Embed, &pos, &neg).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![1.0, 0.0]);
        assert!((v.raw_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn identical_activations_are_rejected() {
        let a = Tensor::new(&[[[1.0_f32, 2.0, 3.0]]], &Device::Cpu).unwrap();
        let err = SteeringVector::from_activations(HookPoint::Embed, &a, &a).unwrap_err();
        assert!(matches!(err, SteerError::Steering(ref m) if m.contains("identical")));
    }

    #[test]
    fn batched_or_mismatched_inputs_are_rejected() {
        let batched = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let single = Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let narrow = Tensor::ones((1, 3, 5), DType::F32, &Device::Cpu).unwrap();
        let flat = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        for (p, n) in [(&batched, &single), (&single, &narrow), (&flat, &single)] {
            assert!(matches!(
                SteeringVector::from_activations(HookPoint::Embed, p, n),
                Err(SteerError::Steering(_))
            ));
        }
    }

    #[test]
    fn scaled_and_intervention_use_the_coefficient() {
        let v = SteeringVector::from_direction(
            HookPoint::ResidPre(0),
            &Tensor::new(&[0.0_f32, 2.0], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let s: Vec<f32> = v.scaled(-3.0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(s, vec![0.0, -3.0]);
        assert!(matches!(v.intervention(1.0).unwrap(), Intervention::Add(_)));
    }
}
