// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steer GPT-2 with a tracing context that edits its point.
//!
//! ```bash
//! cargo run --release --example trace_steering
//! ```
//!
//! Captures the two contrastive activations with plain traces, then opens
//! an editing trace that adds the vector and keeps the last value it saw.

use candle_steer::{
    GenerationConfig, HookFn, HookPoint, HookSpec, HookValue, SteerModel, SteerTokenizer,
    SteeringVector, TraceOptions,
};
use tracing_subscriber::EnvFilter;

fn main() -> candle_steer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let model_id = "openai-community/gpt2";
    let model = SteerModel::from_pretrained(model_id)?;
    let tokenizer = SteerTokenizer::from_pretrained(model_id)?;
    let point = HookPoint::ResidPre(6);
    let hooks = HookSpec::new();

    // 1. Two independent captures.
    let capture = |text: &str| -> candle_steer::Result<candle_core::Tensor> {
        let trace = model.trace(point.clone())?;
        model.forward(&model.input_tensor(&tokenizer.encode(text)?)?, &hooks)?;
        trace.output()
    };
    let love = capture("Love")?;
    let hate = capture("Hate")?;
    let vector = SteeringVector::from_activations(point.clone(), &love, &hate)?;
    println!("{point}: |love - hate| = {:.2}", vector.raw_norm());

    // 2. Editing trace.
    let delta = vector.scaled(5.0 * f64::from(vector.raw_norm()))?;
    let edit = HookFn::new(move |_, value: HookValue| {
        value.map_tensor(|t| Ok(t.broadcast_add(&delta.to_dtype(t.dtype())?)?))
    });
    let prompt = "I hate you because";
    let config = GenerationConfig::greedy(30).with_eos(tokenizer.eos_token_id());
    let trace = model.trace_with(
        point,
        TraceOptions {
            retain_output: true,
            edit_output: Some(edit),
        },
    )?;
    let steered = model.complete(&tokenizer, prompt, &config, &hooks)?;
    println!("steered: {}", steered.full_text);
    println!("last edited activation: {:?}", trace.output()?.dims());
    trace.stop()?;

    let baseline = model.complete(&tokenizer, prompt, &config, &hooks)?;
    println!("baseline: {}", baseline.full_text);
    Ok(())
}
