// SPDX-License-Identifier: MIT OR Apache-2.0

//! Linear projections: loading across weight layouts, and bias shifting.
//!
//! GPT-2 checkpoints store projections as Conv1D weights of shape
//! `[in, out]`; they are transposed once at load so that every projection
//! is a plain candle [`Linear`] computing `x W^T + b`.

use candle_core::{DType, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use crate::config::WeightLayout;
use crate::error::{Result, SteerError};

/// Load a projection from `in_dim` to `out_dim`.
///
/// # Shapes
/// - stored weight: `[out_dim, in_dim]` (standard) or `[in_dim, out_dim]` (GPT-2)
/// - returned `Linear` weight: `[out_dim, in_dim]`
///
/// # Errors
///
/// Returns [`SteerError::Model`] if weight loading fails.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub fn load_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    layout: WeightLayout,
    vb: VarBuilder<'_>,
) -> Result<Linear> {
    match (layout, bias) {
        (WeightLayout::Standard, true) => Ok(candle_nn::linear(in_dim, out_dim, vb)?),
        (WeightLayout::Standard, false) => Ok(candle_nn::linear_no_bias(in_dim, out_dim, vb)?),
        (WeightLayout::Gpt2, _) => {
            let weight = vb
                .get_with_hints((in_dim, out_dim), "weight", candle_nn::init::DEFAULT_KAIMING_NORMAL)?
                // CONTIGUOUS: transposed Conv1D weight feeds every matmul
                .t()?
                .contiguous()?;
            let bias = if bias {
                Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
            } else {
                None
            };
            Ok(Linear::new(weight, bias))
        }
    }
}

/// Add `W · shift` to the bias of `linear`, creating a bias if it has none.
///
/// Returns the previous bias so the caller can put it back with
/// [`restore_bias`].  For any input `x`:
/// `linear'(x) == linear(x + shift)`.
///
/// # Shapes
/// - `shift`: `[in_dim]`
///
/// # Errors
///
/// Returns [`SteerError::Steering`] if `shift` does not match the input
/// width, or [`SteerError::Model`] on tensor failures.
pub fn shift_bias(linear: &mut Linear, shift: &Tensor) -> Result<Option<Tensor>> {
    let weight = linear.weight().clone();
    let (out_dim, in_dim) = weight.dims2()?;
    if shift.dims() != [in_dim] {
        return Err(SteerError::Steering(format!(
            "bias shift has shape {:?}, projection expects [{in_dim}]",
            shift.dims()
        )));
    }

    // PROMOTE: accumulate W · shift in F32, then store in the weight dtype
    let delta = weight
        .to_dtype(DType::F32)?
        .matmul(&shift.to_dtype(DType::F32)?.to_device(weight.device())?.reshape((in_dim, 1))?)?
        .reshape(out_dim)?;

    let previous = linear.bias().cloned();
    let bias = match &previous {
        Some(b) => (b.to_dtype(DType::F32)? + delta)?.to_dtype(b.dtype())?,
        None => delta.to_dtype(weight.dtype())?,
    };
    *linear = Linear::new(weight, Some(bias));
    Ok(previous)
}

/// Put back a bias saved by [`shift_bias`].
pub fn restore_bias(linear: &mut Linear, previous: Option<Tensor>) {
    *linear = Linear::new(linear.weight().clone(), previous);
}

/// [`shift_bias`] every projection in order, all or nothing.
///
/// If projection `k` fails, projections `0..k` get their previous biases
/// back before the error is returned.
///
/// # Errors
///
/// Propagates the first [`shift_bias`] error.
pub fn shift_biases(
    mut projections: Vec<&mut Linear>,
    shift: &Tensor,
) -> Result<Vec<Option<Tensor>>> {
    let mut previous = Vec::with_capacity(projections.len());
    let mut failure = None;
    for linear in &mut projections {
        match shift_bias(linear, shift) {
            Ok(bias) => previous.push(bias),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    if let Some(e) = failure {
        for (linear, bias) in projections.iter_mut().zip(previous) {
            restore_bias(linear, bias);
        }
        return Err(e);
    }
    Ok(previous)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use candle_core::{Device, Module};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn gpt2_layout_is_transposed_at_load() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let lin = load_linear(3, 5, true, WeightLayout::Gpt2, vb.pp("c_fc")).unwrap();
        assert_eq!(lin.weight().dims(), &[5, 3]);
        assert_eq!(lin.bias().unwrap().dims(), &[5]);
        let stored = varmap.data().lock().unwrap().get("c_fc.weight").unwrap().as_tensor().dims().to_vec();
        assert_eq!(stored, vec![3, 5]);
    }

    #[test]
    fn shifted_bias_matches_shifted_input() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut lin = load_linear(4, 3, false, WeightLayout::Standard, vb).unwrap();
        let x = Tensor::new(&[[0.1_f32, 0.2, -0.3, 0.4]], &Device::Cpu).unwrap();
        let shift = Tensor::new(&[1.0_f32, -1.0, 0.5, 2.0], &Device::Cpu).unwrap();

        let expected = lin.forward(&x.broadcast_add(&shift).unwrap()).unwrap();
        let previous = shift_bias(&mut lin, &shift).unwrap();
        assert!(previous.is_none());
        let actual = lin.forward(&x).unwrap();
        let diff: f32 = (expected - actual).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5);

        restore_bias(&mut lin, previous);
        assert!(lin.bias().is_none());
    }

    #[test]
    fn failed_shift_rolls_back_earlier_projections() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut with_bias = load_linear(4, 3, true, WeightLayout::Standard, vb.pp("a")).unwrap();
        let mut no_bias = load_linear(4, 2, false, WeightLayout::Standard, vb.pp("b")).unwrap();
        let mut narrow = load_linear(3, 2, true, WeightLayout::Standard, vb.pp("c")).unwrap();
        let original = with_bias.bias().unwrap().to_vec1::<f32>().unwrap();
        let narrow_bias = narrow.bias().unwrap().to_vec1::<f32>().unwrap();

        let shift = Tensor::new(&[1.0_f32, -1.0, 0.5, 2.0], &Device::Cpu).unwrap();
        let result = shift_biases(vec![&mut with_bias, &mut no_bias, &mut narrow], &shift);
        assert!(matches!(result, Err(SteerError::Steering(_))));

        assert_eq!(with_bias.bias().unwrap().to_vec1::<f32>().unwrap(), original);
        assert!(no_bias.bias().is_none());
        assert_eq!(narrow.bias().unwrap().to_vec1::<f32>().unwrap(), narrow_bias);
    }

    #[test]
    fn shift_biases_returns_one_entry_per_projection() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut a = load_linear(4, 3, true, WeightLayout::Standard, vb.pp("a")).unwrap();
        let mut b = load_linear(4, 2, false, WeightLayout::Standard, vb.pp("b")).unwrap();
        let shift = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();

        let previous = shift_biases(vec![&mut a, &mut b], &shift).unwrap();
        assert_eq!(previous.len(), 2);
        assert!(previous[0].is_some());
        assert!(previous[1].is_none());
        assert!(b.bias().is_some());
    }

    #[test]
    fn wrong_width_shift_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut lin = load_linear(4, 3, true, WeightLayout::Standard, vb).unwrap();
        let shift = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(shift_bias(&mut lin, &shift), Err(SteerError::Steering(_))));
    }
}
