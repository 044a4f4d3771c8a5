// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: steer GPT-2 small loaded from the HuggingFace cache.
//!
//! These tests require `openai-community/gpt2` in the local HF cache and
//! print `SKIP:` otherwise.
//!
//! Run:
//!   `cargo test --test validate_gpt2 -- --nocapture`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::missing_panics_doc,
    missing_docs
)]

use candle_core::Device;
use candle_steer::{
    CoefficientSweep, GenerationConfig, HookPoint, HookSpec, SteerModel, SteerTokenizer,
    SteeringVector, TransformerConfig,
};

const MODEL_ID: &str = "openai-community/gpt2";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Find the HuggingFace cache directory.
fn hf_cache_dir() -> std::path::PathBuf {
    if let Ok(cache) = std::env::var("HF_HOME") {
        return std::path::PathBuf::from(cache).join("hub");
    }
    if let Ok(home) = std::env::var("USERPROFILE") {
        return std::path::PathBuf::from(home)
            .join(".cache")
            .join("huggingface")
            .join("hub");
    }
    if let Ok(home) = std::env::var("HOME") {
        return std::path::PathBuf::from(home)
            .join(".cache")
            .join("huggingface")
            .join("hub");
    }
    panic!("Cannot find HuggingFace cache directory");
}

/// Find the snapshot directory for a given model ID.
fn find_snapshot(model_id: &str) -> Option<std::path::PathBuf> {
    let model_dir_name = format!("models--{}", model_id.replace('/', "--"));
    let snapshots_dir = hf_cache_dir().join(model_dir_name).join("snapshots");
    let entry = std::fs::read_dir(snapshots_dir).ok()?.next()?.ok()?;
    Some(entry.path())
}

/// Load GPT-2 and its tokenizer on CPU, or `None` if not cached.
fn load_gpt2() -> Option<(SteerModel, SteerTokenizer)> {
    let snapshot = find_snapshot(MODEL_ID)?;
    if !snapshot.join("model.safetensors").exists() || !snapshot.join("tokenizer.json").exists() {
        return None;
    }
    let model = SteerModel::from_pretrained_on(MODEL_ID, &Device::Cpu).unwrap();
    let tok = SteerTokenizer::from_file(snapshot.join("tokenizer.json")).unwrap();
    Some((model, tok))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn gpt2_config_parse() {
    let Some(snapshot) = find_snapshot(MODEL_ID) else {
        eprintln!("SKIP: {MODEL_ID} not in cache");
        return;
    };
    let config = TransformerConfig::from_json_file(&snapshot.join("config.json")).unwrap();
    assert_eq!(config.num_layers, 12);
    assert_eq!(config.hidden_size, 768);
    assert_eq!(config.num_attention_heads, 12);
    assert_eq!(config.intermediate_size, 3072);
    assert_eq!(config.max_position_embeddings, 1024);
    assert!(config.tie_word_embeddings);
}

#[test]
fn gpt2_love_hate_steering_cpu() {
    let Some((model, tok)) = load_gpt2() else {
        eprintln!("SKIP: {MODEL_ID} not in cache");
        return;
    };
    let point = HookPoint::ResidPost(6);
    let love = SteeringVector::derive(&model, &tok, point.clone(), "Love", "Hate").unwrap();
    let norm: f32 = love.to_vec().unwrap().iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);

    let prompt = "I hate you because";
    let config = GenerationConfig::greedy(20);
    let baseline = model.complete(&tok, prompt, &config, &HookSpec::new()).unwrap();
    let steered = model
        .with_injection(point.clone(), &love, 10.0 * f64::from(love.raw_norm()), |m| {
            m.complete(&tok, prompt, &config, &HookSpec::new())
        })
        .unwrap();
    let after = model.complete(&tok, prompt, &config, &HookSpec::new()).unwrap();

    eprintln!("baseline: {}", baseline.full_text);
    eprintln!("steered:  {}", steered.full_text);
    assert_ne!(steered.generated_tokens, baseline.generated_tokens);
    assert_eq!(after.generated_tokens, baseline.generated_tokens);
    assert!(model.active_hooks().unwrap().is_empty());
}

#[test]
fn gpt2_bias_edit_matches_injection_cpu() {
    let Some((mut model, tok)) = load_gpt2() else {
        eprintln!("SKIP: {MODEL_ID} not in cache");
        return;
    };
    let point = HookPoint::MlpNorm(6);
    let v = SteeringVector::derive(&model, &tok, point.clone(), "Love", "Hate").unwrap();
    let ids = tok.encode("I hate you because").unwrap();
    let config = GenerationConfig::greedy(10);

    let (injected_ids, injected_logits) = model
        .with_injection(point.clone(), &v, 8.0, |m| {
            Ok((
                m.generate(&ids, &config, &HookSpec::new())?,
                m.next_token_logits(&ids, &HookSpec::new())?,
            ))
        })
        .unwrap();

    let edit = model.edit_bias(point, &v, 8.0).unwrap();
    let edited_ids = edit.generate(&ids, &config, &HookSpec::new()).unwrap();
    let edited_logits = edit.next_token_logits(&ids, &HookSpec::new()).unwrap();
    edit.restore().unwrap();

    let diff: f32 = (edited_logits - injected_logits)
        .unwrap()
        .abs()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(diff < 1e-3, "max logit diff {diff}");
    assert_eq!(edited_ids, injected_ids);
}

#[test]
fn gpt2_coefficient_sweep_cpu() {
    let Some((model, tok)) = load_gpt2() else {
        eprintln!("SKIP: {MODEL_ID} not in cache");
        return;
    };
    let point = HookPoint::ResidPre(6);
    let v = SteeringVector::derive(&model, &tok, point.clone(), "Love", "Hate").unwrap();
    let sweep = CoefficientSweep::run(
        &model,
        &tok,
        "I hate you because",
        &point,
        &v,
        &[-20.0, 0.0, 20.0],
        &GenerationConfig::greedy(8),
    )
    .unwrap();

    let zero = sweep.point_for(0.0).unwrap();
    assert_eq!(zero.tokens, sweep.baseline_tokens);
    assert!(zero.kl_divergence.abs() < 1e-6);
    assert!(sweep.point_for(20.0).unwrap().kl_divergence > 0.0);
    for p in &sweep.points {
        eprintln!("{:+6.1}  kl={:.4}  {}", p.coefficient, p.kl_divergence, p.text);
    }
}
