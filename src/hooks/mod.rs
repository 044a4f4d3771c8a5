// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and injection.
//!
//! - [`HookPoint`]: named interception points in a forward pass.
//! - [`HookValue`]: the value seen at a point, either a bare tensor or a
//!   block output pair.
//! - [`HookSpec`]: per-call captures and interventions.
//! - [`HookCache`]: output logits plus captured activations.
//! - [`HookHandle`] / [`Trace`]: persistent attachments that live in the
//!   model's hook registry until dropped.

mod registry;
mod trace;
mod value;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{Result, SteerError};

pub use registry::{HookHandle, HookId};
pub(crate) use registry::HookRegistry;
pub use trace::{Trace, TraceOptions};
pub use value::{HookFn, HookValue};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or modified.
///
/// Mirrors the `TransformerLens` naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use candle_steer::HookPoint;
///
/// let hook = HookPoint::ResidPost(5);
/// assert_eq!(hook.to_string(), "blocks.5.hook_resid_post");
///
/// let parsed: HookPoint = "blocks.5.ln1.hook_normalized".parse().unwrap();
/// assert_eq!(parsed, HookPoint::AttnNorm(5));
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`], which the built-in
/// backend never fires.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    // -- Embedding --
    /// After token (and learned position) embedding (`hook_embed`).
    Embed,

    // -- Per-layer --
    /// Residual stream entering layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Output of the pre-attention norm in layer `i`
    /// (`blocks.{i}.ln1.hook_normalized`).
    AttnNorm(usize),
    /// Query vectors in layer `i` (`blocks.{i}.attn.hook_q`).
    AttnQ(usize),
    /// Key vectors in layer `i` (`blocks.{i}.attn.hook_k`).
    AttnK(usize),
    /// Value vectors in layer `i` (`blocks.{i}.attn.hook_v`).
    AttnV(usize),
    /// Pre-softmax attention scores in layer `i` (`blocks.{i}.attn.hook_scores`).
    AttnScores(usize),
    /// Post-softmax attention pattern in layer `i` (`blocks.{i}.attn.hook_pattern`).
    AttnPattern(usize),
    /// Attention output in layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// Output of the pre-MLP norm in layer `i` (`blocks.{i}.ln2.hook_normalized`).
    MlpNorm(usize),
    /// MLP output in layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Output of the whole block `i` (`blocks.{i}.hook_resid_post`).
    ///
    /// Seen by hooks as a [`HookValue::Block`] pair.
    ResidPost(usize),

    // -- Final --
    /// After the final norm (`hook_final_norm`).
    FinalNorm,

    // -- Escape hatch --
    /// Name not covered by the enum.
    Custom(String),
}

/// How the value at a [`HookPoint`] is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A bare `[batch, seq, ...]` tensor.
    Tensor,
    /// A `(hidden, present)` pair; the hidden state is the tensor of interest.
    Block,
}

impl HookPoint {
    /// The layer index this point belongs to, if any.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnNorm(i)
            | Self::AttnQ(i)
            | Self::AttnK(i)
            | Self::AttnV(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpNorm(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }

    /// Packaging of the value hooks see at this point.
    ///
    /// Block outputs are pairs; everything else is a bare tensor.
    #[must_use]
    pub const fn output_kind(&self) -> OutputKind {
        match self {
            Self::ResidPost(_) => OutputKind::Block,
            _ => OutputKind::Tensor,
        }
    }

    /// Whether the activation here is `[batch, seq, hidden_size]`, i.e. a
    /// place where a steering vector can be added.
    #[must_use]
    pub const fn is_hidden_width(&self) -> bool {
        matches!(
            self,
            Self::Embed
                | Self::ResidPre(_)
                | Self::AttnNorm(_)
                | Self::AttnOut(_)
                | Self::ResidMid(_)
                | Self::MlpNorm(_)
                | Self::MlpOut(_)
                | Self::ResidPost(_)
                | Self::FinalNorm
        )
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnNorm(i) => write!(f, "blocks.{i}.ln1.hook_normalized"),
            Self::AttnQ(i) => write!(f, "blocks.{i}.attn.hook_q"),
            Self::AttnK(i) => write!(f, "blocks.{i}.attn.hook_k"),
            Self::AttnV(i) => write!(f, "blocks.{i}.attn.hook_v"),
            Self::AttnScores(i) => write!(f, "blocks.{i}.attn.hook_scores"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpNorm(i) => write!(f, "blocks.{i}.ln2.hook_normalized"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

/// Allow `hooks.capture("blocks.5.hook_resid_post")` via `Into<HookPoint>`.
impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`].
fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_final_norm" | "ln_final.hook_normalized" => return HookPoint::FinalNorm,
        _ => {}
    }

    let layered = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
        .and_then(|(layer, suffix)| layer.parse::<usize>().ok().map(|l| (l, suffix)));

    let Some((layer, suffix)) = layered else {
        return HookPoint::Custom(s.to_string());
    };

    match suffix {
        "hook_resid_pre" => HookPoint::ResidPre(layer),
        "ln1.hook_normalized" => HookPoint::AttnNorm(layer),
        "attn.hook_q" => HookPoint::AttnQ(layer),
        "attn.hook_k" => HookPoint::AttnK(layer),
        "attn.hook_v" => HookPoint::AttnV(layer),
        "attn.hook_scores" | "attn.hook_attn_scores" => HookPoint::AttnScores(layer),
        "attn.hook_pattern" => HookPoint::AttnPattern(layer),
        "hook_attn_out" => HookPoint::AttnOut(layer),
        "hook_resid_mid" => HookPoint::ResidMid(layer),
        "ln2.hook_normalized" => HookPoint::MlpNorm(layer),
        "hook_mlp_out" => HookPoint::MlpOut(layer),
        "hook_resid_post" => HookPoint::ResidPost(layer),
        _ => HookPoint::Custom(s.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// A modification applied to the value at a hook point.
///
/// For [`HookValue::Block`] values, tensor interventions touch only the
/// hidden state; the present key/value pair passes through unchanged.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the tensor with a provided value of the same shape.
    Replace(Tensor),
    /// Broadcast-add a tensor (steering). Cast to the activation's dtype
    /// and device at application time.
    Add(Tensor),
    /// Multiply by a constant.
    Scale(f64),
    /// Zero the tensor.
    Zero,
    /// Run an arbitrary callback on the packaged value.
    Callback(HookFn),
}

/// Apply one [`Intervention`] to a hook value.
///
/// # Errors
///
/// Returns [`SteerError::Model`] on tensor failures, or whatever the
/// callback returns.
pub(crate) fn apply_intervention(
    point: &HookPoint,
    value: HookValue,
    intervention: &Intervention,
) -> Result<HookValue> {
    match intervention {
        Intervention::Replace(replacement) => value.map_tensor(|_| Ok(replacement.clone())),
        Intervention::Add(delta) => value.map_tensor(|t| {
            let delta = delta.to_dtype(t.dtype())?.to_device(t.device())?;
            Ok(t.broadcast_add(&delta)?)
        }),
        Intervention::Scale(factor) => value.map_tensor(|t| Ok((t * *factor)?)),
        Intervention::Zero => value.map_tensor(|t| Ok(t.zeros_like()?)),
        Intervention::Callback(hook) => hook.call(point, value),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply
/// during one call.
///
/// Interventions in a spec apply on every forward evaluation of that call,
/// so a spec passed to [`generate`](crate::SteerModel::generate) steers the
/// prefill and each decoding step.  An empty spec adds no work to the
/// forward pass.
///
/// ```
/// use candle_steer::{HookPoint, HookSpec, Intervention};
/// use candle_core::{Device, Tensor};
///
/// let delta = Tensor::zeros((1, 1, 768), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPost(5))
///      .intervene("blocks.6.hook_resid_pre", Intervention::Add(delta));
/// assert_eq!(hooks.num_interventions(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture.
    captures: HashSet<HookPoint>,
    /// Interventions in application order.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Whether a hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }

    /// Every hook point this spec touches.
    pub(crate) fn points(&self) -> impl Iterator<Item = &HookPoint> {
        self.captures
            .iter()
            .chain(self.interventions.iter().map(|(h, _)| h))
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run every intervention registered at `point`, then record a capture.
///
/// Captures see the value that flows downstream, i.e. after interventions.
/// Untouched points return `value` as is.
///
/// # Errors
///
/// Returns [`SteerError::Hook`] if an intervention changes the packaging or
/// the shape of the value, and propagates intervention errors.
pub(crate) fn dispatch(
    point: HookPoint,
    value: HookValue,
    hooks: &HookSpec,
    cache: &mut HookCache,
) -> Result<HookValue> {
    let captured = hooks.is_captured(&point);
    if !captured && !hooks.has_intervention_at(&point) {
        return Ok(value);
    }

    let kind = value.kind();
    let shape = value.tensor().shape().clone();
    let mut value = value;
    for intervention in hooks.interventions_at(&point) {
        value = apply_intervention(&point, value, intervention)?;
    }
    if value.kind() != kind {
        return Err(SteerError::Hook(format!(
            "hook at `{point}` changed the output structure from {kind:?} to {:?}",
            value.kind()
        )));
    }
    if value.tensor().shape() != &shape {
        return Err(SteerError::Hook(format!(
            "hook at `{point}` changed the shape from {shape:?} to {:?}",
            value.tensor().shape()
        )));
    }

    if captured {
        cache.store(point, value.tensor().clone());
    }
    Ok(value)
}

/// [`dispatch`] for points whose value is a bare tensor.
pub(crate) fn dispatch_tensor(
    point: HookPoint,
    tensor: Tensor,
    hooks: &HookSpec,
    cache: &mut HookCache,
) -> Result<Tensor> {
    Ok(dispatch(point, HookValue::Tensor(tensor), hooks, cache)?.into_tensor())
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// Block outputs are stored unpacked: the capture at
/// [`HookPoint::ResidPost`] is the hidden state alone.
///
/// ```
/// use candle_steer::{HookCache, HookPoint};
/// use candle_core::{Device, Tensor};
///
/// let logits = Tensor::zeros((1, 4, 100), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
///
/// let resid = Tensor::zeros((1, 4, 64), candle_core::DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::ResidPost(1), resid);
/// assert!(cache.require(&HookPoint::ResidPost(1)).is_ok());
/// assert!(cache.get(&HookPoint::Embed).is_none());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| SteerError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Remove and return a captured tensor.
    pub fn take(&mut self, hook: &HookPoint) -> Option<Tensor> {
        self.captures.remove(hook)
    }

    /// Store a captured activation.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor once the final logits are known.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::FinalNorm, "hook_final_norm"),
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::AttnNorm(2), "blocks.2.ln1.hook_normalized"),
            (HookPoint::AttnQ(3), "blocks.3.attn.hook_q"),
            (HookPoint::AttnK(3), "blocks.3.attn.hook_k"),
            (HookPoint::AttnV(3), "blocks.3.attn.hook_v"),
            (HookPoint::AttnScores(7), "blocks.7.attn.hook_scores"),
            (HookPoint::AttnPattern(5), "blocks.5.attn.hook_pattern"),
            (HookPoint::AttnOut(2), "blocks.2.hook_attn_out"),
            (HookPoint::ResidMid(11), "blocks.11.hook_resid_mid"),
            (HookPoint::MlpNorm(1), "blocks.1.ln2.hook_normalized"),
            (HookPoint::MlpOut(4), "blocks.4.hook_mlp_out"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_strings_become_custom() {
        let hook: HookPoint = "some.unknown.hook".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("some.unknown.hook".to_string()));
        let hook = HookPoint::from("blocks.x.hook_resid_post");
        assert!(matches!(hook, HookPoint::Custom(_)));
        let hook = HookPoint::from("blocks.3.hook_nothing");
        assert!(matches!(hook, HookPoint::Custom(_)));
    }

    #[test]
    fn output_kind_table() {
        assert_eq!(HookPoint::ResidPost(0).output_kind(), OutputKind::Block);
        for point in [
            HookPoint::Embed,
            HookPoint::ResidPre(0),
            HookPoint::AttnNorm(0),
            HookPoint::MlpNorm(0),
            HookPoint::AttnOut(0),
            HookPoint::FinalNorm,
        ] {
            assert_eq!(point.output_kind(), OutputKind::Tensor, "{point}");
        }
    }

    #[test]
    fn hidden_width_points() {
        assert!(HookPoint::ResidPost(3).is_hidden_width());
        assert!(HookPoint::AttnNorm(3).is_hidden_width());
        assert!(!HookPoint::AttnPattern(3).is_hidden_width());
        assert!(!HookPoint::Custom("x".into()).is_hidden_width());
        assert_eq!(HookPoint::MlpOut(7).layer(), Some(7));
        assert_eq!(HookPoint::Embed.layer(), None);
    }

    #[test]
    fn hook_spec_capture_and_intervention_query() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());

        spec.capture(HookPoint::AttnPattern(5));
        spec.capture("blocks.3.hook_resid_post");
        spec.intervene(HookPoint::ResidPre(5), Intervention::Zero);
        spec.intervene(HookPoint::ResidPre(5), Intervention::Scale(2.0));

        assert!(!spec.is_empty());
        assert_eq!(spec.num_captures(), 2);
        assert!(spec.is_captured(&HookPoint::ResidPost(3)));
        assert!(!spec.is_captured(&HookPoint::Embed));
        assert!(spec.has_intervention_at(&HookPoint::ResidPre(5)));
        assert_eq!(spec.interventions_at(&HookPoint::ResidPre(5)).count(), 2);
        assert_eq!(spec.points().count(), 4);
    }

    #[test]
    fn dispatch_applies_in_order_then_captures() {
        let x = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let delta = Tensor::ones((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let mut spec = HookSpec::new();
        spec.capture(HookPoint::ResidMid(0))
            .intervene(HookPoint::ResidMid(0), Intervention::Add(delta))
            .intervene(HookPoint::ResidMid(0), Intervention::Scale(3.0));

        let mut cache = HookCache::new(x.clone());
        let out = dispatch_tensor(HookPoint::ResidMid(0), x, &spec, &mut cache).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (*v - 6.0).abs() < 1e-6));

        let captured: Vec<f32> = cache
            .require(&HookPoint::ResidMid(0))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(captured, values);
    }

    #[test]
    fn dispatch_rejects_shape_change() {
        let x = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let wider = Tensor::ones((2, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let mut spec = HookSpec::new();
        spec.intervene(HookPoint::Embed, Intervention::Replace(wider));
        let mut cache = HookCache::new(x.clone());
        let err = dispatch_tensor(HookPoint::Embed, x, &spec, &mut cache).unwrap_err();
        assert!(matches!(err, SteerError::Hook(_)));
    }

    #[test]
    fn dispatch_rejects_structure_change() {
        let hidden = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let kv = Tensor::zeros((1, 1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let value = HookValue::Block {
            hidden,
            present: (kv.clone(), kv),
        };
        let unwrap_pair = HookFn::new(|_, v: HookValue| Ok(HookValue::Tensor(v.into_tensor())));
        let mut spec = HookSpec::new();
        spec.intervene(HookPoint::ResidPost(0), Intervention::Callback(unwrap_pair));
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        let err = dispatch(HookPoint::ResidPost(0), value, &spec, &mut cache).unwrap_err();
        assert!(err.to_string().contains("structure"));
    }

    #[test]
    fn untouched_point_is_passthrough() {
        let x = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let spec = HookSpec::new();
        let mut cache = HookCache::new(x.clone());
        let out = dispatch_tensor(HookPoint::Embed, x.clone(), &spec, &mut cache).unwrap();
        assert_eq!(out.id(), x.id());
        assert_eq!(cache.num_captures(), 0);
    }
}
