// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transformer configuration and `HuggingFace` `config.json` parsing.
//!
//! [`TransformerConfig`] describes a decoder-only transformer as a set of
//! orthogonal axes (norm, activation, projection layouts, biases, position
//! encoding, weight naming).  A single hook-aware forward pass in
//! [`crate::transformer`] covers every family listed below, so steering code
//! never needs to know which checkpoint it is talking to.
//!
//! # Usage
//!
//! ```
//! use candle_steer::TransformerConfig;
//!
//! let json = serde_json::json!({
//!     "model_type": "gpt2", "n_embd": 768, "n_layer": 12,
//!     "n_head": 12, "vocab_size": 50257, "n_positions": 1024
//! });
//! let config = TransformerConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_layers, 12);
//! assert_eq!(config.intermediate_size, 3072);
//! ```

use std::fmt;
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, SteerError};

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// Layer normalization variant.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    /// RMS normalization: `x * weight / sqrt(mean(x^2) + eps)`.
    RmsNorm,
    /// Layer normalization with weight and bias.
    LayerNorm,
    /// RMS normalization with a `1 + weight` gain (Gemma).
    GemmaRmsNorm,
}

impl fmt::Display for NormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RmsNorm => write!(f, "RmsNorm"),
            Self::LayerNorm => write!(f, "LayerNorm"),
            Self::GemmaRmsNorm => write!(f, "GemmaRmsNorm"),
        }
    }
}

/// MLP activation function.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `SiLU`, used in `SwiGLU` gating.
    Silu,
    /// Exact (erf) GELU.
    Gelu,
    /// Tanh-approximated GELU (`gelu_new`, `gelu_pytorch_tanh`).
    GeluApprox,
}

impl Activation {
    /// Map a `HuggingFace` `hidden_act` / `activation_function` string.
    fn from_hf_name(name: &str) -> Option<Self> {
        match name {
            "silu" | "swish" => Some(Self::Silu),
            "gelu" => Some(Self::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Some(Self::GeluApprox),
            _ => None,
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silu => write!(f, "SiLU"),
            Self::Gelu => write!(f, "GELU"),
            Self::GeluApprox => write!(f, "GELU (tanh approx)"),
        }
    }
}

/// Layout of the Q, K, V input projections.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// Three linear layers: `q_proj`, `k_proj`, `v_proj`.
    Separate,
    /// One fused linear layer split with `narrow()` (`qkv_proj`, GPT-2 `c_attn`).
    Fused,
}

impl fmt::Display for QkvLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Separate => write!(f, "Separate"),
            Self::Fused => write!(f, "Fused"),
        }
    }
}

/// Layout of the feed-forward block.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlpLayout {
    /// `down(act(gate(x)) * up(x))` with separate gate and up projections.
    GatedSeparate,
    /// Gated MLP whose gate and up projections are one fused matrix.
    GatedFused,
    /// `proj(act(fc(x)))`.
    Plain,
}

impl fmt::Display for MlpLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GatedSeparate => write!(f, "GatedSeparate"),
            Self::GatedFused => write!(f, "GatedFused"),
            Self::Plain => write!(f, "Plain"),
        }
    }
}

/// How token positions enter the model.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEncoding {
    /// Rotary embeddings applied to Q and K inside attention.
    Rotary,
    /// A learned absolute position table added to the token embedding (GPT-2).
    Learned,
}

impl fmt::Display for PositionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rotary => write!(f, "Rotary"),
            Self::Learned => write!(f, "Learned"),
        }
    }
}

/// Naming and storage convention of the safetensors checkpoint.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `model.layers.{i}.self_attn.q_proj` style, `[out, in]` weights.
    Standard,
    /// `h.{i}.attn.c_attn` style with Conv1D `[in, out]` weights.
    Gpt2,
}

impl fmt::Display for WeightLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "Standard"),
            Self::Gpt2 => write!(f, "GPT-2"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransformerConfig
// ---------------------------------------------------------------------------

/// Configuration for a generic decoder-only transformer.
///
/// # Supported model families
///
/// | Family | Distinguishing axes |
/// |--------|---------------------|
/// | GPT-2 | learned positions, `LayerNorm`, fused Conv1D projections, bias everywhere |
/// | `LLaMA` 1/2/3 | baseline: GQA, `SiLU`, `RmsNorm`, rotary |
/// | `Qwen` 2/2.5 | + QKV bias |
/// | Gemma / Gemma 2 | + `GemmaRmsNorm`, embedding scale, soft-capping, 4-norm |
/// | `Phi-3` | + fused QKV, fused gate/up |
/// | `StarCoder2` | + plain MLP, bias everywhere |
/// | Mistral | + sliding window |
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // Config structs legitimately have many boolean axes
pub struct TransformerConfig {
    // --- Dimensions ----------------------------------------------------------
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of decoder blocks.
    pub num_layers: usize,
    /// Number of query heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA when < `num_attention_heads`).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// MLP intermediate dimension.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,

    // --- Architecture axes ---------------------------------------------------
    /// Normalization variant.
    pub norm_type: NormType,
    /// Epsilon for normalization layers.
    pub norm_eps: f64,
    /// MLP activation function.
    pub activation: Activation,
    /// QKV projection layout.
    pub qkv_layout: QkvLayout,
    /// MLP layout.
    pub mlp_layout: MlpLayout,
    /// Whether the Q, K, V projections carry a bias.
    pub qkv_bias: bool,
    /// Whether the attention output projection carries a bias.
    pub o_proj_bias: bool,
    /// Whether the MLP projections carry a bias.
    pub mlp_bias: bool,
    /// Multiplier applied to token embeddings (`sqrt(hidden_size)` for Gemma).
    pub embedding_scale: Option<f64>,
    /// Whether the LM head reuses the token embedding matrix.
    pub tie_word_embeddings: bool,
    /// Checkpoint naming convention.
    pub weight_layout: WeightLayout,

    // --- Positional encoding -------------------------------------------------
    /// Rotary or learned absolute positions.
    pub position_encoding: PositionEncoding,
    /// Base frequency for rotary embeddings (unused for learned positions).
    pub rope_theta: f64,
    /// Length of the position table; also the longest sequence accepted.
    pub max_position_embeddings: usize,

    // --- Gemma 2 extensions --------------------------------------------------
    /// `tanh(scores / cap) * cap` before softmax.
    pub attn_logit_softcapping: Option<f64>,
    /// `tanh(logits / cap) * cap` after the LM head.
    pub final_logit_softcapping: Option<f64>,
    /// When set, attention scale is `1/sqrt(scalar)` instead of `1/sqrt(head_dim)`.
    pub query_pre_attn_scalar: Option<f64>,
    /// Post-attention and post-feedforward norms (4 norms per layer).
    pub use_post_norms: bool,

    // --- Sliding window attention --------------------------------------------
    /// Sliding window size; `None` for global attention.
    pub sliding_window: Option<usize>,
    /// Even layers use the sliding window, odd layers are global (Gemma 2).
    pub alternating_sliding_window: bool,
}

// ---------------------------------------------------------------------------
// Config parsing — entry points
// ---------------------------------------------------------------------------

impl TransformerConfig {
    /// Parse a [`TransformerConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// Dispatches on `model_type` to a family-specific parser.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if `model_type` is missing or
    /// unsupported, or if a required field is absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| SteerError::Config("missing 'model_type' field".into()))?;

        let parsed = match model_type {
            "gpt2" => Self::parse_gpt2(config),
            "llama" => Self::parse_llama(config),
            "qwen2" => Self::parse_qwen2(config),
            "gemma" => Self::parse_gemma(config),
            "gemma2" => Self::parse_gemma2(config),
            "phi3" => Self::parse_phi3(config),
            "starcoder2" => Self::parse_starcoder2(config),
            "mistral" => Self::parse_mistral(config),
            other => Err(SteerError::Config(format!(
                "unsupported model_type: '{other}'"
            ))),
        }?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Read and parse a `config.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SteerError::Config(format!("read {}: {e}", path.display())))?;
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| SteerError::Config(format!("parse {}: {e}", path.display())))?;
        Self::from_hf_config(&json)
    }

    /// Check cross-field invariants the forward pass relies on.
    fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_kv_heads == 0 {
            return Err(SteerError::Config("head counts must be non-zero".into()));
        }
        if self.num_attention_heads % self.num_kv_heads != 0 {
            return Err(SteerError::Config(format!(
                "num_attention_heads ({}) is not a multiple of num_kv_heads ({})",
                self.num_attention_heads, self.num_kv_heads
            )));
        }
        if self.position_encoding == PositionEncoding::Rotary && self.head_dim % 2 != 0 {
            return Err(SteerError::Config(format!(
                "rotary embeddings need an even head_dim, got {}",
                self.head_dim
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-family config parsers
// ---------------------------------------------------------------------------

/// Family defaults that differ between otherwise `LLaMA`-shaped configs.
struct FamilyDefaults {
    /// Key holding the norm epsilon.
    eps_key: &'static str,
    /// Epsilon when the key is absent.
    eps: f64,
    /// `rope_theta` when absent.
    rope_theta: f64,
    /// `max_position_embeddings` when absent.
    max_positions: usize,
    /// `tie_word_embeddings` when absent.
    tied: bool,
}

impl TransformerConfig {
    /// Shared `LLaMA`-shaped baseline; every rotary family starts here.
    fn rotary_baseline(config: &Value, defaults: &FamilyDefaults) -> Result<Self> {
        let hidden_size = get_usize(config, "hidden_size")?;
        let num_attention_heads = get_usize(config, "num_attention_heads")?;

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            num_attention_heads,
            num_kv_heads: get_usize_or(config, "num_key_value_heads", num_attention_heads),
            head_dim: get_head_dim(config, hidden_size, num_attention_heads)?,
            intermediate_size: get_usize(config, "intermediate_size")?,
            vocab_size: get_usize(config, "vocab_size")?,

            norm_type: NormType::RmsNorm,
            norm_eps: get_f64_or(config, defaults.eps_key, defaults.eps),
            activation: Activation::Silu,
            qkv_layout: QkvLayout::Separate,
            mlp_layout: MlpLayout::GatedSeparate,
            qkv_bias: false,
            o_proj_bias: false,
            mlp_bias: false,
            embedding_scale: None,
            tie_word_embeddings: get_bool_or(config, "tie_word_embeddings", defaults.tied),
            weight_layout: WeightLayout::Standard,

            position_encoding: PositionEncoding::Rotary,
            rope_theta: get_f64_or(config, "rope_theta", defaults.rope_theta),
            max_position_embeddings: get_usize_or(
                config,
                "max_position_embeddings",
                defaults.max_positions,
            ),

            attn_logit_softcapping: None,
            final_logit_softcapping: None,
            query_pre_attn_scalar: None,
            use_post_norms: false,
            sliding_window: None,
            alternating_sliding_window: false,
        })
    }

    /// Parse a GPT-2 config (`gpt2`, `distilgpt2`, `gpt2-medium`, ...).
    ///
    /// GPT-2 uses its own key names (`n_embd`, `n_layer`, `n_head`) and
    /// leaves `n_inner` null to mean `4 * n_embd`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if required dimension fields are missing.
    fn parse_gpt2(config: &Value) -> Result<Self> {
        let hidden_size = get_usize(config, "n_embd")?;
        let num_attention_heads = get_usize(config, "n_head")?;
        if num_attention_heads == 0 {
            return Err(SteerError::Config("n_head is 0".into()));
        }
        let activation = config
            .get("activation_function")
            .and_then(Value::as_str)
            .map_or(Some(Activation::GeluApprox), Activation::from_hf_name)
            .ok_or_else(|| SteerError::Config("unsupported activation_function".into()))?;

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "n_layer")?,
            num_attention_heads,
            num_kv_heads: num_attention_heads,
            head_dim: hidden_size / num_attention_heads,
            intermediate_size: get_optional_usize(config, "n_inner").unwrap_or(4 * hidden_size),
            vocab_size: get_usize(config, "vocab_size")?,

            norm_type: NormType::LayerNorm,
            norm_eps: get_f64_or(config, "layer_norm_epsilon", 1e-5),
            activation,
            qkv_layout: QkvLayout::Fused,
            mlp_layout: MlpLayout::Plain,
            qkv_bias: true,
            o_proj_bias: true,
            mlp_bias: true,
            embedding_scale: None,
            tie_word_embeddings: true,
            weight_layout: WeightLayout::Gpt2,

            position_encoding: PositionEncoding::Learned,
            rope_theta: 0.0,
            max_position_embeddings: get_usize_or(config, "n_positions", 1024),

            attn_logit_softcapping: None,
            final_logit_softcapping: None,
            query_pre_attn_scalar: None,
            use_post_norms: false,
            sliding_window: None,
            alternating_sliding_window: false,
        })
    }

    /// Parse a `LLaMA`-family config.
    fn parse_llama(config: &Value) -> Result<Self> {
        Self::rotary_baseline(
            config,
            &FamilyDefaults {
                eps_key: "rms_norm_eps",
                eps: 1e-5,
                rope_theta: 10_000.0,
                max_positions: 4096,
                tied: false,
            },
        )
    }

    /// Parse a Qwen2/Qwen2.5 config: `LLaMA` plus QKV bias.
    fn parse_qwen2(config: &Value) -> Result<Self> {
        let base = Self::rotary_baseline(
            config,
            &FamilyDefaults {
                eps_key: "rms_norm_eps",
                eps: 1e-6,
                rope_theta: 1_000_000.0,
                max_positions: 32_768,
                tied: false,
            },
        )?;
        Ok(Self {
            qkv_bias: get_bool_or(config, "attention_bias", true),
            ..base
        })
    }

    /// Parse a Gemma 1 config: `GemmaRmsNorm`, scaled embeddings, GELU.
    fn parse_gemma(config: &Value) -> Result<Self> {
        let base = Self::rotary_baseline(
            config,
            &FamilyDefaults {
                eps_key: "rms_norm_eps",
                eps: 1e-6,
                rope_theta: 10_000.0,
                max_positions: 8192,
                tied: true,
            },
        )?;
        Ok(Self {
            norm_type: NormType::GemmaRmsNorm,
            activation: Activation::GeluApprox,
            embedding_scale: Some(sqrt_width(base.hidden_size)),
            ..base
        })
    }

    /// Parse a Gemma 2 config: Gemma plus soft-capping, post norms and
    /// alternating sliding window.
    fn parse_gemma2(config: &Value) -> Result<Self> {
        let base = Self::parse_gemma(config)?;
        Ok(Self {
            attn_logit_softcapping: get_optional_f64(config, "attn_logit_softcapping"),
            final_logit_softcapping: get_optional_f64(config, "final_logit_softcapping"),
            query_pre_attn_scalar: get_optional_f64(config, "query_pre_attn_scalar")
                .or(Some(256.0)),
            use_post_norms: true,
            sliding_window: get_optional_usize(config, "sliding_window"),
            alternating_sliding_window: true,
            ..base
        })
    }

    /// Parse a Phi-3 config: fused QKV and fused gate/up.
    fn parse_phi3(config: &Value) -> Result<Self> {
        let base = Self::parse_llama(config)?;
        Ok(Self {
            qkv_layout: QkvLayout::Fused,
            mlp_layout: MlpLayout::GatedFused,
            ..base
        })
    }

    /// Parse a `StarCoder2` config: plain MLP, GELU, bias everywhere.
    fn parse_starcoder2(config: &Value) -> Result<Self> {
        let base = Self::rotary_baseline(
            config,
            &FamilyDefaults {
                eps_key: "norm_epsilon",
                eps: 1e-5,
                rope_theta: 10_000.0,
                max_positions: 16_384,
                tied: true,
            },
        )?;
        let use_bias = get_bool_or(config, "use_bias", true);
        let norm_type = match config.get("norm_type").and_then(Value::as_str) {
            Some("layer_norm") => NormType::LayerNorm,
            _ => NormType::RmsNorm,
        };
        Ok(Self {
            norm_type,
            activation: Activation::GeluApprox,
            mlp_layout: MlpLayout::Plain,
            qkv_bias: use_bias,
            o_proj_bias: use_bias,
            mlp_bias: use_bias,
            sliding_window: get_optional_usize(config, "sliding_window"),
            ..base
        })
    }

    /// Parse a Mistral config: `LLaMA` plus a sliding window on every layer.
    fn parse_mistral(config: &Value) -> Result<Self> {
        let base = Self::rotary_baseline(
            config,
            &FamilyDefaults {
                eps_key: "rms_norm_eps",
                eps: 1e-5,
                rope_theta: 10_000.0,
                max_positions: 32_768,
                tied: false,
            },
        )?;
        Ok(Self {
            sliding_window: get_optional_usize(config, "sliding_window"),
            ..base
        })
    }
}

/// `sqrt(hidden_size)` as `f64`.
fn sqrt_width(hidden_size: usize) -> f64 {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    // PROMOTE: widths are far below 2^52, the cast is exact
    (hidden_size as f64).sqrt()
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| SteerError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| SteerError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract a `usize` field with a default.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract a `usize` field, `None` if absent or null.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract an `f64` field with a default.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    get_optional_f64(config, key).unwrap_or(default)
}

/// Extract an `f64` field, `None` if absent or null.
fn get_optional_f64(config: &Value, key: &str) -> Option<f64> {
    config.get(key).and_then(Value::as_f64)
}

/// Extract a `bool` field with a default.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Explicit `head_dim`, else `hidden_size / num_attention_heads`.
fn get_head_dim(config: &Value, hidden_size: usize, num_attention_heads: usize) -> Result<usize> {
    if let Some(hd) = config.get("head_dim").and_then(Value::as_u64) {
        return usize::try_from(hd).map_err(|_| SteerError::Config("head_dim overflows usize".into()));
    }
    if num_attention_heads == 0 {
        return Err(SteerError::Config(
            "num_attention_heads is 0, cannot compute head_dim".into(),
        ));
    }
    Ok(hidden_size / num_attention_heads)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gpt2_json() -> Value {
        serde_json::json!({
            "model_type": "gpt2",
            "activation_function": "gelu_new",
            "n_embd": 768,
            "n_head": 12,
            "n_layer": 12,
            "n_inner": null,
            "n_positions": 1024,
            "layer_norm_epsilon": 1e-5,
            "vocab_size": 50257
        })
    }

    #[test]
    fn parse_gpt2_defaults() {
        let config = TransformerConfig::from_hf_config(&gpt2_json()).unwrap();
        assert_eq!(config.hidden_size, 768);
        assert_eq!(config.num_layers, 12);
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.num_kv_heads, 12);
        assert_eq!(config.intermediate_size, 3072);
        assert_eq!(config.norm_type, NormType::LayerNorm);
        assert_eq!(config.activation, Activation::GeluApprox);
        assert_eq!(config.qkv_layout, QkvLayout::Fused);
        assert_eq!(config.mlp_layout, MlpLayout::Plain);
        assert_eq!(config.position_encoding, PositionEncoding::Learned);
        assert_eq!(config.weight_layout, WeightLayout::Gpt2);
        assert_eq!(config.max_position_embeddings, 1024);
        assert!(config.qkv_bias && config.o_proj_bias && config.mlp_bias);
        assert!(config.tie_word_embeddings);
    }

    #[test]
    fn parse_gpt2_rejects_unknown_activation() {
        let mut json = gpt2_json();
        json["activation_function"] = Value::from("relu6");
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn parse_llama_baseline() {
        let json = serde_json::json!({
            "model_type": "llama",
            "hidden_size": 2048,
            "num_hidden_layers": 16,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "intermediate_size": 8192,
            "vocab_size": 128256,
            "rope_theta": 500000.0
        });
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.num_kv_heads, 8);
        assert_eq!(config.norm_type, NormType::RmsNorm);
        assert_eq!(config.position_encoding, PositionEncoding::Rotary);
        assert_eq!(config.weight_layout, WeightLayout::Standard);
        assert!(!config.qkv_bias);
        assert!((config.rope_theta - 500_000.0).abs() < f64::EPSILON);
        assert_eq!(config.max_position_embeddings, 4096);
    }

    #[test]
    fn parse_gemma2_layers_on_gemma() {
        let json = serde_json::json!({
            "model_type": "gemma2",
            "hidden_size": 2304,
            "num_hidden_layers": 26,
            "num_attention_heads": 8,
            "num_key_value_heads": 4,
            "head_dim": 256,
            "intermediate_size": 9216,
            "vocab_size": 256000,
            "attn_logit_softcapping": 50.0,
            "final_logit_softcapping": 30.0,
            "sliding_window": 4096
        });
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.norm_type, NormType::GemmaRmsNorm);
        assert_eq!(config.head_dim, 256);
        assert!((config.embedding_scale.unwrap() - 48.0).abs() < 1e-9);
        assert!((config.query_pre_attn_scalar.unwrap() - 256.0).abs() < f64::EPSILON);
        assert!(config.use_post_norms);
        assert!(config.alternating_sliding_window);
        assert_eq!(config.sliding_window, Some(4096));
    }

    #[test]
    fn parse_phi3_and_starcoder2_layouts() {
        let phi3 = serde_json::json!({
            "model_type": "phi3", "hidden_size": 3072, "num_hidden_layers": 32,
            "num_attention_heads": 32, "intermediate_size": 8192, "vocab_size": 32064
        });
        let config = TransformerConfig::from_hf_config(&phi3).unwrap();
        assert_eq!(config.qkv_layout, QkvLayout::Fused);
        assert_eq!(config.mlp_layout, MlpLayout::GatedFused);

        let starcoder = serde_json::json!({
            "model_type": "starcoder2", "hidden_size": 3072, "num_hidden_layers": 30,
            "num_attention_heads": 24, "num_key_value_heads": 2,
            "intermediate_size": 12288, "vocab_size": 49152, "norm_type": "layer_norm"
        });
        let config = TransformerConfig::from_hf_config(&starcoder).unwrap();
        assert_eq!(config.mlp_layout, MlpLayout::Plain);
        assert_eq!(config.norm_type, NormType::LayerNorm);
        assert!(config.mlp_bias);
    }

    #[test]
    fn grouped_heads_must_divide() {
        let json = serde_json::json!({
            "model_type": "mistral", "hidden_size": 64, "num_hidden_layers": 2,
            "num_attention_heads": 4, "num_key_value_heads": 3,
            "intermediate_size": 128, "vocab_size": 100
        });
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn unsupported_or_missing_model_type_errors() {
        assert!(TransformerConfig::from_hf_config(&serde_json::json!({ "model_type": "bert" })).is_err());
        assert!(TransformerConfig::from_hf_config(&serde_json::json!({ "hidden_size": 768 })).is_err());
    }
}
