// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-head attention with GQA, separate/fused QKV, KV caching and hooks.
//!
//! Grouped-query (GQA), multi-head (MHA) and multi-query (MQA) attention are
//! all expressed through `num_kv_heads`.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{QkvLayout, TransformerConfig, WeightLayout};
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec, dispatch_tensor};

use super::proj::load_linear;
use super::rope::RopeCache;

// ---------------------------------------------------------------------------
// QKV projection — separate or fused
// ---------------------------------------------------------------------------

/// QKV input projection.
enum QkvProj {
    /// `q_proj`, `k_proj`, `v_proj`.
    Separate {
        /// Query projection.
        q_proj: Linear,
        /// Key projection.
        k_proj: Linear,
        /// Value projection.
        v_proj: Linear,
    },
    /// One fused projection (`qkv_proj`, GPT-2 `c_attn`), split with `narrow()`.
    Fused {
        /// Fused projection.
        qkv_proj: Linear,
        /// `num_attention_heads * head_dim`.
        q_dim: usize,
        /// `num_kv_heads * head_dim`.
        kv_dim: usize,
    },
}

impl QkvProj {
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `(q, k, v)`, each `[batch, seq, proj_dim]`
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        match self {
            Self::Separate {
                q_proj,
                k_proj,
                v_proj,
            } => Ok((q_proj.forward(x)?, k_proj.forward(x)?, v_proj.forward(x)?)),
            Self::Fused {
                qkv_proj,
                q_dim,
                kv_dim,
            } => {
                let qkv = qkv_proj.forward(x)?;
                let q = qkv.narrow(D::Minus1, 0, *q_dim)?;
                let k = qkv.narrow(D::Minus1, *q_dim, *kv_dim)?;
                let v = qkv.narrow(D::Minus1, q_dim + kv_dim, *kv_dim)?;
                Ok((q, k, v))
            }
        }
    }

    /// Every projection reading the attention input.
    fn projections_mut(&mut self) -> Vec<&mut Linear> {
        match self {
            Self::Separate {
                q_proj,
                k_proj,
                v_proj,
            } => vec![q_proj, k_proj, v_proj],
            Self::Fused { qkv_proj, .. } => vec![qkv_proj],
        }
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Per-call inputs shared by every layer's attention.
pub struct AttentionContext<'a> {
    /// Additive mask, `[1, 1, seq, kv_len]`.
    pub mask: &'a Tensor,
    /// Rotary tables; `None` for learned absolute positions.
    pub rope: Option<&'a RopeCache>,
    /// Absolute position of the first new token.
    pub start_pos: usize,
}

/// Self-attention layer with hook points.
pub struct Attention {
    /// QKV projection.
    qkv: QkvProj,
    /// Output projection (`o_proj` / `c_proj`).
    o_proj: Linear,
    /// Query heads.
    num_attention_heads: usize,
    /// Key/value heads.
    num_kv_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// `1/sqrt(head_dim)` or `1/sqrt(query_pre_attn_scalar)`.
    scale: f64,
    /// Attention logit soft-cap (Gemma 2).
    attn_logit_softcapping: Option<f64>,
}

impl Attention {
    /// Load attention weights.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_kv_heads * config.head_dim;
        let layout = config.weight_layout;
        let bias = config.qkv_bias;

        let (fused_name, out_name) = match layout {
            WeightLayout::Standard => ("qkv_proj", "o_proj"),
            WeightLayout::Gpt2 => ("c_attn", "c_proj"),
        };

        let qkv = match config.qkv_layout {
            QkvLayout::Separate => QkvProj::Separate {
                q_proj: load_linear(hidden, q_dim, bias, layout, vb.pp("q_proj"))?,
                k_proj: load_linear(hidden, kv_dim, bias, layout, vb.pp("k_proj"))?,
                v_proj: load_linear(hidden, kv_dim, bias, layout, vb.pp("v_proj"))?,
            },
            QkvLayout::Fused => QkvProj::Fused {
                qkv_proj: load_linear(hidden, q_dim + 2 * kv_dim, bias, layout, vb.pp(fused_name))?,
                q_dim,
                kv_dim,
            },
        };
        let o_proj = load_linear(q_dim, hidden, config.o_proj_bias, layout, vb.pp(out_name))?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = config.query_pre_attn_scalar.map_or_else(
            || 1.0 / (config.head_dim as f64).sqrt(),
            |scalar| 1.0 / scalar.sqrt(),
        );

        Ok(Self {
            qkv,
            o_proj,
            num_attention_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            scale,
            attn_logit_softcapping: config.attn_logit_softcapping,
        })
    }

    /// Projections that read the attention input directly.
    ///
    /// They are the only consumers of the pre-attention norm output.
    pub fn input_projections_mut(&mut self) -> Vec<&mut Linear> {
        self.qkv.projections_mut()
    }

    /// Attend the new positions in `x` over cached and new keys.
    ///
    /// Returns the attention output and the present `(keys, values)` pair
    /// (past positions followed by the new ones, keys already rotated).
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - `past`: `[batch, num_kv_heads, past_len, head_dim]` each
    /// - returns: `[batch, seq, hidden_size]` and two
    ///   `[batch, num_kv_heads, past_len + seq, head_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor failures
    /// and propagates hook errors.
    pub fn forward(
        &self,
        x: &Tensor,
        past: Option<&(Tensor, Tensor)>,
        ctx: &AttentionContext<'_>,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let (batch, seq_len, _hidden) = x.dims3()?;

        let (q, k, v) = self.qkv.forward(x)?;

        // [batch, seq, heads, head_dim] -> [batch, heads, seq, head_dim]
        let q = q
            .reshape((batch, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = dispatch_tensor(HookPoint::AttnQ(layer_idx), q, hooks, cache)?;
        let k = dispatch_tensor(HookPoint::AttnK(layer_idx), k, hooks, cache)?;
        let v = dispatch_tensor(HookPoint::AttnV(layer_idx), v, hooks, cache)?;

        let (q, k) = match ctx.rope {
            Some(rope) => (rope.apply(&q, ctx.start_pos)?, rope.apply(&k, ctx.start_pos)?),
            None => (q, k),
        };

        // CONTIGUOUS: cat and the matmuls below need unit-stride inputs
        let (k, v) = match past {
            Some((past_k, past_v)) => (
                Tensor::cat(&[past_k, &k.contiguous()?], 2)?,
                Tensor::cat(&[past_v, &v.contiguous()?], 2)?,
            ),
            None => (k.contiguous()?, v.contiguous()?),
        };
        let present = (k.clone(), v.clone());

        let k = repeat_kv(k, self.num_attention_heads, self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_attention_heads, self.num_kv_heads)?;

        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let q = q.contiguous()?;
        let scores = (q.matmul(&k_t)? * self.scale)?;
        let mut scores = dispatch_tensor(HookPoint::AttnScores(layer_idx), scores, hooks, cache)?;

        if let Some(cap) = self.attn_logit_softcapping {
            scores = ((scores / cap)?.tanh()? * cap)?;
        }
        let scores = scores.broadcast_add(ctx.mask)?;

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let dtype = scores.dtype();
        let pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let pattern = dispatch_tensor(HookPoint::AttnPattern(layer_idx), pattern, hooks, cache)?;

        let out = pattern
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_attention_heads * self.head_dim))?;

        Ok((self.o_proj.forward(&out)?, present))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand key/value heads for GQA.
///
/// # Shapes
/// - `x`: `[batch, n_kv_heads, seq, head_dim]`
/// - returns: `[batch, n_heads, seq, head_dim]`
fn repeat_kv(x: Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    if n_heads == n_kv_heads {
        return Ok(x);
    }
    let repeats = n_heads / n_kv_heads;
    let (batch, _, seq_len, head_dim) = x.dims4()?;
    Ok(x
        .unsqueeze(2)?
        .expand((batch, n_kv_heads, repeats, seq_len, head_dim))?
        .reshape((batch, n_heads, seq_len, head_dim))?)
}
