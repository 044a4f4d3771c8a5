// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation steering.
//!
//! - [`SteeringVector`]: unit-norm direction from two contrastive prompts.
//! - [`SteerModel::inject`](crate::SteerModel::inject): scoped addition of
//!   `coefficient * vector` at a hook point on every forward evaluation.
//! - [`BiasEdit`]: the same shift folded into the biases of the affine
//!   projections reading a norm output.
//! - [`CoefficientSweep`]: steered completions and KL divergence over a
//!   range of coefficients.

mod bias_edit;
mod inject;
mod sweep;
mod vector;

pub use bias_edit::BiasEdit;
pub(crate) use inject::{check_target, injection_hook};
pub use sweep::{CoefficientSweep, STANDARD_COEFFICIENTS, SweepPoint, kl_divergence};
pub use vector::SteeringVector;
