// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic transformer backend.
//!
//! One hook-aware forward pass covers GPT-2, `LLaMA`, `Qwen2`, Gemma,
//! Gemma 2, `Phi-3`, `StarCoder2` and Mistral, parameterized by
//! [`TransformerConfig`].
//!
//! Per layer, hook points fire in this order:
//!
//! ```text
//! resid_pre -> ln1.hook_normalized -> attn.{q,k,v,scores,pattern} -> attn_out
//!   -> resid_mid -> ln2.hook_normalized -> mlp_out -> resid_post (block pair)
//! ```

pub(crate) mod attention;
pub(crate) mod mlp;
pub(crate) mod norm;
pub(crate) mod proj;
pub(crate) mod rope;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::backend::{BiasSnapshot, SteerBackend};
use crate::cache::KVCache;
use crate::config::{PositionEncoding, TransformerConfig, WeightLayout};
use crate::error::{Result, SteerError};
use crate::hooks::{HookCache, HookPoint, HookSpec, HookValue, dispatch, dispatch_tensor};
use crate::util::masks;

use self::attention::{Attention, AttentionContext};
use self::mlp::Mlp;
use self::norm::{Norm, create_norm};
use self::proj::{restore_bias, shift_biases};
use self::rope::RopeCache;

// ---------------------------------------------------------------------------
// Weight names
// ---------------------------------------------------------------------------

/// Checkpoint names that differ between weight layouts.
struct WeightNames {
    /// Token embedding.
    embed: &'static str,
    /// Learned position embedding.
    positions: &'static str,
    /// Layer prefix (`{prefix}.{i}`).
    layers: &'static str,
    /// Final norm.
    final_norm: &'static str,
    /// Pre-attention norm.
    input_norm: &'static str,
    /// Attention block.
    attention: &'static str,
    /// Pre-MLP norm in 2-norm layers.
    mid_norm: &'static str,
}

impl WeightNames {
    /// Names for `layout`.
    const fn for_layout(layout: WeightLayout) -> Self {
        match layout {
            WeightLayout::Standard => Self {
                embed: "embed_tokens",
                positions: "embed_positions",
                layers: "layers",
                final_norm: "norm",
                input_norm: "input_layernorm",
                attention: "self_attn",
                mid_norm: "post_attention_layernorm",
            },
            WeightLayout::Gpt2 => Self {
                embed: "wte",
                positions: "wpe",
                layers: "h",
                final_norm: "ln_f",
                input_norm: "ln_1",
                attention: "attn",
                mid_norm: "ln_2",
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TransformerLayer
// ---------------------------------------------------------------------------

/// A single decoder layer.
struct TransformerLayer {
    /// Pre-attention norm.
    input_norm: Norm,
    /// Self-attention.
    attention: Attention,
    /// Post-attention norm (Gemma 2 only).
    post_attention_norm: Option<Norm>,
    /// Pre-MLP norm.
    mid_norm: Norm,
    /// Post-MLP norm (Gemma 2 only).
    post_feedforward_norm: Option<Norm>,
    /// Feed-forward block.
    mlp: Mlp,
}

impl TransformerLayer {
    /// Load one decoder layer.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TransformerConfig, names: &WeightNames, vb: VarBuilder<'_>) -> Result<Self> {
        let norm = |name: &str| {
            create_norm(config.norm_type, config.hidden_size, config.norm_eps, vb.pp(name))
        };

        // Gemma 2 has four norms; its pre-MLP norm is `pre_feedforward_layernorm`
        // and `post_attention_layernorm` becomes a true post-norm.
        let (post_attention_norm, mid_norm, post_feedforward_norm) = if config.use_post_norms {
            (
                Some(norm("post_attention_layernorm")?),
                norm("pre_feedforward_layernorm")?,
                Some(norm("post_feedforward_layernorm")?),
            )
        } else {
            (None, norm(names.mid_norm)?, None)
        };

        Ok(Self {
            input_norm: norm(names.input_norm)?,
            attention: Attention::load(config, vb.pp(names.attention))?,
            post_attention_norm,
            mid_norm,
            post_feedforward_norm,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// GenericTransformer
// ---------------------------------------------------------------------------

/// Config-driven generic transformer backend.
pub struct GenericTransformer {
    /// Token embedding matrix.
    embed_tokens: Embedding,
    /// Learned position embedding (GPT-2); `None` for rotary models.
    embed_positions: Option<Embedding>,
    /// Decoder layers.
    layers: Vec<TransformerLayer>,
    /// Final norm before the LM head.
    final_norm: Norm,
    /// LM head; `None` when tied to `embed_tokens`.
    lm_head: Option<Linear>,
    /// Rotary tables; `None` for learned positions.
    rope_cache: Option<RopeCache>,
    /// Model configuration.
    config: TransformerConfig,
}

impl GenericTransformer {
    /// Load a generic transformer from a [`VarBuilder`].
    ///
    /// Standard checkpoints live under `model.`; GPT-2 checkpoints are
    /// accepted both bare (`wte.weight`) and under `transformer.`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let names = WeightNames::for_layout(config.weight_layout);
        let root = match config.weight_layout {
            WeightLayout::Standard => vb.pp("model"),
            WeightLayout::Gpt2 if vb.contains_tensor("transformer.wte.weight") => {
                vb.pp("transformer")
            }
            WeightLayout::Gpt2 => vb.clone(),
        };

        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.hidden_size, root.pp(names.embed))?;

        let (embed_positions, rope_cache) = match config.position_encoding {
            PositionEncoding::Learned => (
                Some(candle_nn::embedding(
                    config.max_position_embeddings,
                    config.hidden_size,
                    root.pp(names.positions),
                )?),
                None,
            ),
            PositionEncoding::Rotary => (
                None,
                Some(RopeCache::new(
                    config.head_dim,
                    config.max_position_embeddings,
                    config.rope_theta,
                    device,
                    dtype,
                )?),
            ),
        };

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let vb_layer = root.pp(format!("{}.{i}", names.layers));
            layers.push(TransformerLayer::load(&config, &names, vb_layer)?);
        }

        let final_norm = create_norm(
            config.norm_type,
            config.hidden_size,
            config.norm_eps,
            root.pp(names.final_norm),
        )?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        tracing::debug!(
            layers = config.num_layers,
            hidden = config.hidden_size,
            layout = %config.weight_layout,
            positions = %config.position_encoding,
            "generic transformer loaded"
        );

        Ok(Self {
            embed_tokens,
            embed_positions,
            layers,
            final_norm,
            lm_head,
            rope_cache,
            config,
        })
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden_size]` or `[batch, hidden_size]`
    /// - returns: `[batch, seq, vocab_size]` or `[batch, vocab_size]`
    fn project_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = match &self.lm_head {
            Some(head) => head.forward(hidden)?,
            // Tied embeddings: logits = hidden @ embed_tokens^T
            None => hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?,
        };
        match self.config.final_logit_softcapping {
            Some(cap) => Ok(((logits / cap)?.tanh()? * cap)?),
            None => Ok(logits),
        }
    }

    /// Whether `layer_idx` attends through the sliding window.
    fn uses_sliding_window(&self, layer_idx: usize) -> bool {
        match (self.config.sliding_window, self.config.alternating_sliding_window) {
            (Some(_), true) => layer_idx % 2 == 0, // Gemma 2: even layers
            (Some(_), false) => true,                       // Mistral: all layers
            (None, _) => false,
        }
    }

    /// Token (plus learned position) embedding for `input_ids`.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: `[batch, seq, hidden_size]`
    fn embed(&self, input_ids: &Tensor, start_pos: usize) -> Result<Tensor> {
        let mut hidden = self.embed_tokens.forward(input_ids)?;
        if let Some(scale) = self.config.embedding_scale {
            hidden = (hidden * scale)?;
        }
        if let Some(wpe) = &self.embed_positions {
            let seq_len = input_ids.dim(1)?;
            let to_u32 = |n: usize| {
                u32::try_from(n).map_err(|_| SteerError::Config(format!("position {n} overflows u32")))
            };
            let positions = Tensor::arange(
                to_u32(start_pos)?,
                to_u32(start_pos + seq_len)?,
                input_ids.device(),
            )?;
            hidden = hidden.broadcast_add(&wpe.forward(&positions)?.unsqueeze(0)?)?;
        }
        Ok(hidden)
    }

    /// Layer `idx`, or a steering error naming the hook point.
    fn layer_mut(&mut self, idx: usize, point: &HookPoint) -> Result<&mut TransformerLayer> {
        let n = self.layers.len();
        self.layers.get_mut(idx).ok_or_else(|| {
            SteerError::Steering(format!("`{point}` is out of range for a {n}-layer model"))
        })
    }

    /// The affine projections that are the sole consumers of `point`.
    fn input_projections_mut(&mut self, point: &HookPoint) -> Result<Vec<&mut Linear>> {
        match point {
            HookPoint::AttnNorm(i) => Ok(self.layer_mut(*i, point)?.attention.input_projections_mut()),
            HookPoint::MlpNorm(i) => Ok(self.layer_mut(*i, point)?.mlp.input_projections_mut()),
            other => Err(SteerError::Steering(format!(
                "bias editing needs a point read only by affine projections \
                 (`blocks.N.ln1.hook_normalized` or `blocks.N.ln2.hook_normalized`), got `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// SteerBackend implementation
// ---------------------------------------------------------------------------

impl SteerBackend for GenericTransformer {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn num_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    fn max_position_embeddings(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
        kv_cache: Option<&mut KVCache>,
    ) -> Result<HookCache> {
        let mut kv_cache = kv_cache;
        let device = input_ids.device();
        let (_batch, seq_len) = input_ids.dims2()?;
        let start_pos = match kv_cache.as_deref() {
            Some(kv) => kv.seq_len()?,
            None => 0,
        };
        let kv_len = start_pos + seq_len;
        if kv_len > self.config.max_position_embeddings {
            return Err(SteerError::Config(format!(
                "sequence of {kv_len} tokens exceeds max_position_embeddings ({})",
                self.config.max_position_embeddings
            )));
        }

        // Capture cache; the real output is set at the end.
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, device)?);

        let hidden = self.embed(input_ids, start_pos)?;
        let dtype = hidden.dtype();
        let mut hidden = dispatch_tensor(HookPoint::Embed, hidden, hooks, &mut cache)?;

        // Masks are shared by every layer of the same kind.
        let global_mask = masks::create_causal_mask(seq_len, kv_len, start_pos, None, device, dtype)?;
        let sliding_mask = match self.config.sliding_window {
            Some(window) => Some(masks::create_causal_mask(
                seq_len,
                kv_len,
                start_pos,
                Some(window),
                device,
                dtype,
            )?),
            None => None,
        };

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            hidden = dispatch_tensor(HookPoint::ResidPre(layer_idx), hidden, hooks, &mut cache)?;

            // --- Attention ---
            let normed = layer.input_norm.forward(&hidden)?;
            let normed = dispatch_tensor(HookPoint::AttnNorm(layer_idx), normed, hooks, &mut cache)?;

            let mask = match (&sliding_mask, self.uses_sliding_window(layer_idx)) {
                (Some(sliding), true) => sliding,
                _ => &global_mask,
            };
            let ctx = AttentionContext {
                mask,
                rope: self.rope_cache.as_ref(),
                start_pos,
            };
            let past = match kv_cache.as_deref() {
                Some(kv) => kv.layer(layer_idx)?.cloned(),
                None => None,
            };
            let (mut attn_out, present) =
                layer
                    .attention
                    .forward(&normed, past.as_ref(), &ctx, layer_idx, hooks, &mut cache)?;
            if let Some(norm) = &layer.post_attention_norm {
                attn_out = norm.forward(&attn_out)?;
            }
            let attn_out = dispatch_tensor(HookPoint::AttnOut(layer_idx), attn_out, hooks, &mut cache)?;

            hidden = dispatch_tensor(
                HookPoint::ResidMid(layer_idx),
                (hidden + attn_out)?,
                hooks,
                &mut cache,
            )?;

            // --- MLP ---
            let normed = layer.mid_norm.forward(&hidden)?;
            let normed = dispatch_tensor(HookPoint::MlpNorm(layer_idx), normed, hooks, &mut cache)?;
            let mut mlp_out = layer.mlp.forward(&normed)?;
            if let Some(norm) = &layer.post_feedforward_norm {
                mlp_out = norm.forward(&mlp_out)?;
            }
            let mlp_out = dispatch_tensor(HookPoint::MlpOut(layer_idx), mlp_out, hooks, &mut cache)?;

            // --- Block output: (hidden, present) ---
            let block = HookValue::Block {
                hidden: (hidden + mlp_out)?,
                present,
            };
            let HookValue::Block { hidden: out, present } =
                dispatch(HookPoint::ResidPost(layer_idx), block, hooks, &mut cache)?
            else {
                return Err(SteerError::Hook(format!(
                    "`{}` must stay a block output",
                    HookPoint::ResidPost(layer_idx)
                )));
            };
            hidden = out;

            if let Some(kv) = kv_cache.as_deref_mut() {
                kv.set_layer(layer_idx, present)?;
            }
        }

        let hidden = self.final_norm.forward(&hidden)?;
        let hidden = dispatch_tensor(HookPoint::FinalNorm, hidden, hooks, &mut cache)?;

        cache.set_output(self.project_logits(&hidden)?);
        Ok(cache)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        self.project_logits(hidden)
    }

    fn shift_input_bias(&mut self, point: &HookPoint, shift: &Tensor) -> Result<BiasSnapshot> {
        let previous = shift_biases(self.input_projections_mut(point)?, shift)?;
        Ok(BiasSnapshot::new(point.clone(), previous))
    }

    fn restore_input_bias(&mut self, snapshot: BiasSnapshot) -> Result<()> {
        let (point, previous) = snapshot.into_parts();
        let projections = self.input_projections_mut(&point)?;
        if projections.len() != previous.len() {
            return Err(SteerError::Steering(format!(
                "bias snapshot for `{point}` holds {} biases, model has {} projections",
                previous.len(),
                projections.len()
            )));
        }
        for (linear, bias) in projections.into_iter().zip(previous) {
            restore_bias(linear, bias);
        }
        Ok(())
    }
}
