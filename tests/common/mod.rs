// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tiny randomly initialised models and a word-level tokenizer for
//! integration tests that must not touch the network.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    missing_docs
)]

use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_steer::{SteerModel, SteerTokenizer, TransformerConfig};

/// Vocabulary of the test tokenizer, in ID order.
pub const WORDS: [&str; 12] = [
    "<unk>", "I", "love", "hate", "you", "because", "the", "cat", "dog", "is", "happy", "</s>",
];

/// Word-level tokenizer over [`WORDS`].
pub fn tokenizer() -> SteerTokenizer {
    let vocab: Vec<String> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| format!("\"{w}\": {i}"))
        .collect();
    let json = format!(
        r#"{{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {{ "type": "WhitespaceSplit" }},
            "post_processor": null,
            "decoder": null,
            "model": {{
                "type": "WordLevel",
                "vocab": {{ {} }},
                "unk_token": "<unk>"
            }}
        }}"#,
        vocab.join(", ")
    );
    SteerTokenizer::from_hf(tokenizers::Tokenizer::from_str(&json).unwrap())
}

/// Build a randomly initialised model from a `config.json` value.
fn random_model(config: &serde_json::Value) -> SteerModel {
    let config = TransformerConfig::from_hf_config(config).unwrap();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    SteerModel::from_config(config, vb, &Device::Cpu).unwrap()
}

/// 2-layer `LLaMA`-shaped model: GQA, rotary, `RmsNorm`, gated MLP, no biases.
pub fn tiny_llama() -> SteerModel {
    random_model(&serde_json::json!({
        "model_type": "llama",
        "hidden_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "intermediate_size": 32,
        "vocab_size": WORDS.len(),
        "max_position_embeddings": 64,
        "rms_norm_eps": 1e-5,
        "tie_word_embeddings": false
    }))
}

/// 2-layer GPT-2-shaped model: learned positions, `LayerNorm`, fused Conv1D
/// projections, biases everywhere, tied embeddings.
pub fn tiny_gpt2() -> SteerModel {
    random_model(&serde_json::json!({
        "model_type": "gpt2",
        "n_embd": 16,
        "n_head": 4,
        "n_layer": 2,
        "vocab_size": WORDS.len(),
        "n_positions": 64
    }))
}

/// 2-layer Gemma 2-shaped model: scaled embeddings, `(w + 1)` norms, post
/// norms, attention and final soft-caps.  Layer 0 attends through a window
/// of 3, shorter than the test prompt; layer 1 is global.
pub fn tiny_gemma2() -> SteerModel {
    random_model(&serde_json::json!({
        "model_type": "gemma2",
        "hidden_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "head_dim": 4,
        "intermediate_size": 32,
        "vocab_size": WORDS.len(),
        "max_position_embeddings": 64,
        "attn_logit_softcapping": 50.0,
        "final_logit_softcapping": 30.0,
        "query_pre_attn_scalar": 4,
        "sliding_window": 3
    }))
}

/// 2-layer Mistral-shaped model: `LLaMA` with a window of 3 on every layer.
pub fn tiny_mistral() -> SteerModel {
    random_model(&serde_json::json!({
        "model_type": "mistral",
        "hidden_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "intermediate_size": 32,
        "vocab_size": WORDS.len(),
        "max_position_embeddings": 64,
        "sliding_window": 3
    }))
}

/// 2-layer Phi-3-shaped model: fused QKV and fused gate/up, no biases.
pub fn tiny_phi3() -> SteerModel {
    random_model(&serde_json::json!({
        "model_type": "phi3",
        "hidden_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 4,
        "intermediate_size": 32,
        "vocab_size": WORDS.len(),
        "max_position_embeddings": 64
    }))
}

/// Every test family, labelled.
pub fn tiny_models() -> Vec<(&'static str, SteerModel)> {
    vec![
        ("llama", tiny_llama()),
        ("gpt2", tiny_gpt2()),
        ("gemma2", tiny_gemma2()),
        ("mistral", tiny_mistral()),
        ("phi3", tiny_phi3()),
    ]
}

/// Largest absolute elementwise difference.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

/// Flat `f32` copy of a tensor.
pub fn to_vec(t: &Tensor) -> Vec<f32> {
    t.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1().unwrap()
}
