// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`SteerBackend`] is the trait every model backend implements.
//! [`SteerModel`] wraps a backend with its device and the hook registry,
//! and is the entry point for capture, injection, bias editing and
//! generation.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::cache::KVCache;
use crate::config::TransformerConfig;
use crate::error::{Result, SteerError};
use crate::generation::{GenerationConfig, GenerationResult, Sampler};
use crate::hooks::{
    HookCache, HookFn, HookHandle, HookId, HookPoint, HookRegistry, HookSpec, Trace, TraceOptions,
};
use crate::steering::{BiasEdit, SteeringVector, check_target, injection_hook};
use crate::tokenizer::SteerTokenizer;
use crate::transformer::GenericTransformer;

// ---------------------------------------------------------------------------
// SteerBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for model backends with hook-aware forward passes.
///
/// The single [`forward`](Self::forward) method takes a [`HookSpec`] of
/// captures and interventions and an optional [`KVCache`], and returns a
/// [`HookCache`] with the logits plus any requested activations.
///
/// Bias editing is an optional capability; the default implementations
/// report it as unsupported.
pub trait SteerBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of decoder layers.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Number of attention heads.
    fn num_heads(&self) -> usize;

    /// Longest sequence the position encoding covers.
    fn max_position_embeddings(&self) -> usize;

    // --- Core forward pass -----------------------------------------------

    /// Forward pass with hook capture and interventions.
    ///
    /// When `hooks` is empty this must be equivalent to a plain forward
    /// pass.  With a `kv_cache`, `input_ids` holds only the new positions;
    /// the cache is read for the past and extended with the present.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures,
    /// [`SteerError::Config`] if the sequence outgrows the position table,
    /// and propagates hook errors.
    fn forward(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
        kv_cache: Option<&mut KVCache>,
    ) -> Result<HookCache>;

    // --- Logit projection ------------------------------------------------

    /// Project a hidden-state tensor to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]` -- final-norm hidden states
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on shape mismatch or tensor failure.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;

    // --- Optional capabilities -------------------------------------------

    /// Fold `shift` into the biases of the affine projections that are the
    /// only consumers of `point`, returning the previous biases.
    ///
    /// # Shapes
    /// - `shift`: `[hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if the backend or the point does not
    /// support bias editing.
    fn shift_input_bias(&mut self, point: &HookPoint, _shift: &Tensor) -> Result<BiasSnapshot> {
        Err(SteerError::Steering(format!(
            "bias editing at `{point}` is not supported by this backend"
        )))
    }

    /// Put back biases saved by [`shift_input_bias`](Self::shift_input_bias).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if the backend does not support bias
    /// editing or the snapshot does not fit the model.
    fn restore_input_bias(&mut self, snapshot: BiasSnapshot) -> Result<()> {
        Err(SteerError::Steering(format!(
            "bias editing at `{}` is not supported by this backend",
            snapshot.point()
        )))
    }
}

// ---------------------------------------------------------------------------
// BiasSnapshot
// ---------------------------------------------------------------------------

/// Biases saved before a bias edit, in projection order.
///
/// `None` entries are projections that had no bias.
#[derive(Debug)]
pub struct BiasSnapshot {
    /// Edited hook point.
    point: HookPoint,
    /// Previous biases.
    previous: Vec<Option<Tensor>>,
}

impl BiasSnapshot {
    /// Record the previous biases of the projections behind `point`.
    #[must_use]
    pub const fn new(point: HookPoint, previous: Vec<Option<Tensor>>) -> Self {
        Self { point, previous }
    }

    /// Edited hook point.
    #[must_use]
    pub const fn point(&self) -> &HookPoint {
        &self.point
    }

    /// Number of saved projections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.previous.len()
    }

    /// Whether no projection was saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    /// Split into the point and the previous biases.
    #[must_use]
    pub fn into_parts(self) -> (HookPoint, Vec<Option<Tensor>>) {
        (self.point, self.previous)
    }
}

// ---------------------------------------------------------------------------
// SteerModel
// ---------------------------------------------------------------------------

/// High-level model wrapper: a backend, its device and its hook registry.
///
/// Callbacks attached through [`register_hook`](Self::register_hook),
/// [`trace`](Self::trace) or [`inject`](Self::inject) live in the registry
/// and fire on every forward evaluation until their guard is dropped.
pub struct SteerModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn SteerBackend>,
    /// The device this model lives on.
    device: Device,
    /// Persistent hook attachments.
    registry: Arc<HookRegistry>,
}

impl SteerModel {
    /// Load a model from a `HuggingFace` model ID on the best device.
    ///
    /// # `DType` selection
    ///
    /// - **CUDA**: `BF16`
    /// - **CPU**: `F32` for full precision
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Download`] if files cannot be fetched,
    /// [`SteerError::Config`] if the model type is unsupported, or
    /// [`SteerError::Model`] if weight loading fails.
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let device = Self::select_device()?;
        Self::from_pretrained_on(model_id, &device)
    }

    /// Load a model from a `HuggingFace` model ID onto `device`.
    ///
    /// Files come from the local hub cache when present.
    ///
    /// # Errors
    ///
    /// Same as [`from_pretrained`](Self::from_pretrained).
    pub fn from_pretrained_on(model_id: &str, device: &Device) -> Result<Self> {
        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let files = crate::download::download_model(model_id)?;
        let config = TransformerConfig::from_json_file(&files.config)?;
        tracing::info!(
            model = model_id,
            layers = config.num_layers,
            hidden = config.hidden_size,
            ?dtype,
            "loading model"
        );

        let vb = create_var_builder(&files.weights, dtype, device)?;
        Self::from_config(config, vb, device)
    }

    /// Build the generic transformer for `config` from a [`VarBuilder`].
    ///
    /// The compute dtype is the var builder's.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn from_config(config: TransformerConfig, vb: VarBuilder<'_>, device: &Device) -> Result<Self> {
        let dtype = vb.dtype();
        let transformer = GenericTransformer::load(config, device, dtype, vb)?;
        Ok(Self::new(Box::new(transformer), device.clone()))
    }

    /// Select the best available device (CUDA GPU 0, or CPU fallback).
    fn select_device() -> Result<Device> {
        Ok(Device::cuda_if_available(0)?)
    }

    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn SteerBackend>, device: Device) -> Self {
        Self {
            backend,
            device,
            registry: Arc::new(HookRegistry::new()),
        }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Number of attention heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.backend.num_heads()
    }

    /// Access the underlying backend.
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn SteerBackend {
        &*self.backend
    }

    /// Mutable backend access, for parameter edits.
    pub(crate) fn backend_mut(&mut self) -> &mut dyn SteerBackend {
        &mut *self.backend
    }

    // --- Hook registry ---------------------------------------------------

    /// Check that `point` fires on this model.
    fn validate_point(&self, point: &HookPoint) -> Result<()> {
        if let HookPoint::Custom(name) = point {
            return Err(SteerError::Hook(format!(
                "unknown hook point `{name}` never fires on this model"
            )));
        }
        match point.layer() {
            Some(layer) if layer >= self.num_layers() => Err(SteerError::Hook(format!(
                "`{point}` is out of range for a {}-layer model",
                self.num_layers()
            ))),
            _ => Ok(()),
        }
    }

    /// Attach a callback at `point` until the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the point is unknown, out of range
    /// or already occupied.
    pub fn register_hook(&self, point: HookPoint, hook: HookFn) -> Result<HookHandle> {
        self.validate_point(&point)?;
        HookHandle::attach(&self.registry, point, hook)
    }

    /// Detach a hook kept with [`HookHandle::keep`].
    ///
    /// Returns `false` if it was already detached.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the registry lock is poisoned.
    pub fn remove_hook(&self, id: HookId) -> Result<bool> {
        self.registry.detach(id)
    }

    /// Detach every attached hook; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the registry lock is poisoned.
    pub fn clear_hooks(&self) -> Result<usize> {
        self.registry.clear()
    }

    /// Attached hooks, in attachment order.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the registry lock is poisoned.
    pub fn active_hooks(&self) -> Result<Vec<(HookId, HookPoint)>> {
        self.registry.active()
    }

    /// `hooks` followed by every attached callback.
    fn merged_spec<'a>(&self, hooks: &'a HookSpec) -> Result<Cow<'a, HookSpec>> {
        if self.registry.len()? == 0 {
            return Ok(Cow::Borrowed(hooks));
        }
        let mut merged = hooks.clone();
        self.registry.extend_spec(&mut merged)?;
        Ok(Cow::Owned(merged))
    }

    // --- Forward passes --------------------------------------------------

    /// Run a forward pass with the given hook specification.
    ///
    /// Per-call interventions run first at each point, then attached
    /// callbacks in attachment order.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the backend and from hooks.
    pub fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let merged = self.merged_spec(hooks)?;
        self.backend.forward(input_ids, &merged, None)
    }

    /// Forward the new positions in `input_ids` against a [`KVCache`].
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, new_seq]`
    /// - returns: logits at `[batch, new_seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the backend and from hooks.
    pub fn forward_cached(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
        kv_cache: &mut KVCache,
    ) -> Result<HookCache> {
        let merged = self.merged_spec(hooks)?;
        self.backend.forward(input_ids, &merged, Some(kv_cache))
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]` -- final-norm hidden states
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        self.backend.project_to_vocab(hidden)
    }

    /// Token IDs as a `[1, seq]` tensor on this model's device.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor failures.
    pub fn input_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }

    /// Logits for the token following `prompt_ids`, as `F32`.
    ///
    /// # Shapes
    /// - returns: `[vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates forward-pass errors.
    pub fn next_token_logits(&self, prompt_ids: &[u32], hooks: &HookSpec) -> Result<Tensor> {
        let cache = self.forward(&self.input_tensor(prompt_ids)?, hooks)?;
        last_position_logits(cache.output())
    }

    // --- Capture ---------------------------------------------------------

    /// One-shot capture of the activation at `point`.
    ///
    /// Block outputs are unpacked to their hidden state.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: `[batch, seq, ...]`, point-dependent
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the point never fires on this model.
    pub fn capture(&self, input_ids: &Tensor, point: &HookPoint) -> Result<Tensor> {
        self.validate_point(point)?;
        let mut hooks = HookSpec::new();
        hooks.capture(point.clone());
        let mut cache = self.forward(input_ids, &hooks)?;
        cache
            .take(point)
            .ok_or_else(|| SteerError::Hook(format!("hook point `{point}` was not captured")))
    }

    /// Trace `point`, retaining the value of every forward evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the point is unknown, out of range
    /// or already occupied.
    pub fn trace(&self, point: HookPoint) -> Result<Trace> {
        self.trace_with(point, TraceOptions::default())
    }

    /// Trace `point` with explicit retain/edit options.
    ///
    /// # Errors
    ///
    /// Same as [`trace`](Self::trace).
    pub fn trace_with(&self, point: HookPoint, options: TraceOptions) -> Result<Trace> {
        self.validate_point(&point)?;
        Trace::attach(&self.registry, point, options)
    }

    // --- Steering --------------------------------------------------------

    /// Add `coefficient * vector` at `point` on every forward evaluation
    /// until the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] if the point does not carry a
    /// hidden-size activation or the vector's width differs from the
    /// model's, and [`SteerError::Hook`] if the point is occupied.
    pub fn inject(
        &self,
        point: HookPoint,
        vector: &SteeringVector,
        coefficient: f64,
    ) -> Result<HookHandle> {
        check_target(self.hidden_size(), &point, vector)?;
        let hook = injection_hook(vector.scaled(coefficient)?);
        let handle = self.register_hook(point, hook)?;
        tracing::debug!(
            point = %handle.point(),
            coefficient,
            source = %vector.hook_point(),
            "steering injection attached"
        );
        Ok(handle)
    }

    /// Run `f` with an injection attached, detaching it afterwards.
    ///
    /// The injection is removed whether `f` succeeds, fails or panics.
    ///
    /// # Errors
    ///
    /// Returns the injection error, `f`'s error, or a detach error, in that
    /// order of precedence.
    pub fn with_injection<R, F>(
        &self,
        point: HookPoint,
        vector: &SteeringVector,
        coefficient: f64,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&Self) -> Result<R>,
    {
        let handle = self.inject(point, vector, coefficient)?;
        let result = f(self);
        let detached = handle.remove();
        let out = result?;
        detached?;
        Ok(out)
    }

    /// Fold `coefficient * vector` into the biases of the projections that
    /// read `point`, until the returned guard is dropped.
    ///
    /// Only points whose sole consumers are affine projections are
    /// accepted: `blocks.{i}.ln1.hook_normalized` and
    /// `blocks.{i}.ln2.hook_normalized`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Steering`] for any other point or a width
    /// mismatch.
    pub fn edit_bias(
        &mut self,
        point: HookPoint,
        vector: &SteeringVector,
        coefficient: f64,
    ) -> Result<BiasEdit<'_>> {
        BiasEdit::apply(self, point, vector, coefficient)
    }

    // --- Generation ------------------------------------------------------

    /// Autoregressive KV-cached generation.
    ///
    /// `hooks` and every attached callback apply to the prefill and to
    /// each single-token decoding step.  Returns the generated IDs only.
    /// Stops early at `config.eos_token_id` or when the position table is
    /// full.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] for an empty prompt and propagates
    /// forward-pass errors.
    pub fn generate(
        &self,
        prompt_ids: &[u32],
        config: &GenerationConfig,
        hooks: &HookSpec,
    ) -> Result<Vec<u32>> {
        if prompt_ids.is_empty() {
            return Err(SteerError::Config("cannot generate from an empty prompt".into()));
        }
        let max_positions = self.backend.max_position_embeddings();
        tracing::debug!(
            prompt_tokens = prompt_ids.len(),
            max_new_tokens = config.max_new_tokens,
            active_hooks = self.registry.len()?,
            spec_interventions = hooks.num_interventions(),
            "generation started"
        );

        let mut sampler = Sampler::new(config.decoding);
        let mut kv_cache = KVCache::new(self.num_layers());
        let mut generated = Vec::with_capacity(config.max_new_tokens);
        let mut input = self.input_tensor(prompt_ids)?;

        for _ in 0..config.max_new_tokens {
            let cache = self.forward_cached(&input, hooks, &mut kv_cache)?;
            let next = sampler.sample(&last_position_logits(cache.output())?)?;
            generated.push(next);

            if config.eos_token_id == Some(next) {
                break;
            }
            if prompt_ids.len() + generated.len() >= max_positions {
                tracing::debug!(max_positions, "position table full, stopping");
                break;
            }
            input = self.input_tensor(&[next])?;
        }

        tracing::debug!(generated = generated.len(), "generation finished");
        Ok(generated)
    }

    /// Encode `prompt`, generate, and decode.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer and generation errors.
    pub fn complete(
        &self,
        tokenizer: &SteerTokenizer,
        prompt: &str,
        config: &GenerationConfig,
        hooks: &HookSpec,
    ) -> Result<GenerationResult> {
        let prompt_tokens = tokenizer.encode(prompt)?;
        let generated_tokens = self.generate(&prompt_tokens, config, hooks)?;

        let all: Vec<u32> = prompt_tokens
            .iter()
            .chain(generated_tokens.iter())
            .copied()
            .collect();

        Ok(GenerationResult {
            prompt: prompt.to_owned(),
            full_text: tokenizer.decode(&all)?,
            generated_text: tokenizer.decode(&generated_tokens)?,
            total_tokens: all.len(),
            prompt_tokens,
            generated_tokens,
        })
    }
}

impl std::fmt::Debug for SteerModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SteerModel")
            .field("device", &self.device)
            .field("num_layers", &self.num_layers())
            .field("hidden_size", &self.hidden_size())
            .field("num_heads", &self.num_heads())
            .finish_non_exhaustive()
    }
}

/// Logits of the last position of the first batch row, as `F32`.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab_size]`
/// - returns: `[vocab_size]`
fn last_position_logits(logits: &Tensor) -> Result<Tensor> {
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    if seq_len == 0 {
        return Err(SteerError::Model(candle_core::Error::Msg("empty sequence".into())));
    }
    Ok(logits
        .narrow(0, 0, 1)?
        .narrow(1, seq_len - 1, 1)?
        .flatten_all()?
        .to_dtype(DType::F32)?)
}

// ---------------------------------------------------------------------------
// Weight loading helpers (used by from_pretrained)
// ---------------------------------------------------------------------------

/// Create a `VarBuilder` from safetensors file paths.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading for reduced memory overhead on large models.
fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered (safe) reading; all data goes into RAM.
///
/// Only supports single-file models. For sharded models, enable the
/// `mmap` feature.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let path = match paths {
        [single] => single,
        [] => return Err(SteerError::Config("no safetensors files".into())),
        _ => {
            return Err(SteerError::Config(
                "sharded models require the `mmap` feature: \
                 candle-steer = { features = [\"mmap\"] }"
                    .into(),
            ));
        }
    };
    let data = std::fs::read(path)?;
    Ok(VarBuilder::from_buffered_safetensors(data, dtype, device)?)
}

/// Load weights via memory-mapped files; minimal RAM overhead for large models.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}
