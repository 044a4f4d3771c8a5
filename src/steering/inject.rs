// SPDX-License-Identifier: MIT OR Apache-2.0

//! Injection callbacks.
//!
//! An injection is an [`Intervention::Add`] run from the hook registry, so
//! a persistent injection and a per-call `HookSpec` addition compute the
//! same thing.

use candle_core::Tensor;

use crate::error::{Result, SteerError};
use crate::hooks::{HookFn, HookPoint, Intervention, apply_intervention};

use super::SteeringVector;

/// Check that `vector` can steer `point` on a model of width `hidden_size`.
///
/// # Errors
///
/// Returns [`SteerError::Steering`] if `point` does not carry a
/// hidden-size activation or the widths differ.
pub(crate) fn check_target(hidden_size: usize, point: &HookPoint, vector: &SteeringVector) -> Result<()> {
    if !point.is_hidden_width() {
        return Err(SteerError::Steering(format!(
            "`{point}` does not carry a hidden-size activation"
        )));
    }
    if vector.hidden_size() != hidden_size {
        return Err(SteerError::Steering(format!(
            "steering vector has width {}, model hidden size is {hidden_size}",
            vector.hidden_size()
        )));
    }
    Ok(())
}

/// A callback adding `delta` to the value at its point.
///
/// Block outputs keep their present key/value pair.
///
/// # Shapes
/// - `delta`: broadcastable to the activation, e.g. `[1, 1, hidden_size]`
pub(crate) fn injection_hook(delta: Tensor) -> HookFn {
    let add = Intervention::Add(delta);
    HookFn::new(move |point, value| apply_intervention(point, value, &add))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::hooks::HookValue;

    fn unit(hidden: usize) -> SteeringVector {
        let mut d = vec![0.0_f32; hidden];
        if let Some(first) = d.first_mut() {
            *first = 1.0;
        }
        SteeringVector::from_direction(HookPoint::Embed, &Tensor::new(d, &Device::Cpu).unwrap())
            .unwrap()
    }

    #[test]
    fn block_injection_keeps_present_pair() {
        let hidden = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let k = Tensor::ones((1, 1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let v = Tensor::ones((1, 1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let value = HookValue::Block {
            hidden,
            present: (k.clone(), v.clone()),
        };

        let hook = injection_hook(unit(3).scaled(2.0).unwrap());
        let out = hook.call(&HookPoint::ResidPost(0), value).unwrap();

        let (pk, pv) = out.present().unwrap();
        assert_eq!(pk.id(), k.id());
        assert_eq!(pv.id(), v.id());
        let h: Vec<Vec<f32>> = out.tensor().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(h, vec![vec![2.0, 0.0, 0.0], vec![2.0, 0.0, 0.0]]);
    }

    #[test]
    fn delta_is_cast_to_activation_dtype() {
        let x = Tensor::zeros((1, 1, 2), DType::BF16, &Device::Cpu).unwrap();
        let hook = injection_hook(unit(2).scaled(1.0).unwrap());
        let out = hook.call(&HookPoint::Embed, HookValue::Tensor(x)).unwrap();
        assert_eq!(out.tensor().dtype(), DType::BF16);
    }

    #[test]
    fn targets_are_checked() {
        let v = unit(4);
        assert!(check_target(4, &HookPoint::ResidPost(0), &v).is_ok());
        assert!(check_target(4, &HookPoint::MlpNorm(1), &v).is_ok());
        assert!(matches!(
            check_target(8, &HookPoint::ResidPost(0), &v),
            Err(SteerError::Steering(_))
        ));
        assert!(matches!(
            check_target(4, &HookPoint::AttnPattern(0), &v),
            Err(SteerError::Steering(_))
        ));
    }
}
