// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steer GPT-2 through a per-call hook specification.
//!
//! ```bash
//! cargo run --release --example hook_spec_steering
//! ```
//!
//! The intervention lives only in the `HookSpec` handed to `generate`, so
//! it covers the prefill and every decoding step of that call and nothing
//! else.  A coefficient sweep shows the dose-response.

use candle_steer::{
    CoefficientSweep, GenerationConfig, HookPoint, HookSpec, STANDARD_COEFFICIENTS, SteerModel,
    SteerTokenizer, SteeringVector,
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
    let vector = SteeringVector::derive(&model, &tokenizer, point.clone(), "Love", "Hate")?;
    let scale = f64::from(vector.raw_norm());

    let prompt = "I hate you because";
    let ids = tokenizer.encode(prompt)?;
    let config = GenerationConfig::greedy(30).with_eos(tokenizer.eos_token_id());

    let mut hooks = HookSpec::new();
    hooks.intervene(point.clone(), vector.intervention(5.0 * scale)?);
    let steered = model.generate(&ids, &config, &hooks)?;
    println!("steered: {prompt}{}", tokenizer.decode(&steered)?);

    // Sweep in units of the raw difference norm.
    let coefficients: Vec<f64> = STANDARD_COEFFICIENTS.iter().map(|c| c * scale).collect();
    let sweep = CoefficientSweep::run(
        &model,
        &tokenizer,
        prompt,
        &point,
        &vector,
        &coefficients,
        &GenerationConfig::greedy(15),
    )?;
    println!("\nbaseline: {}", sweep.baseline_text);
    for p in &sweep.points {
        println!("{:+8.1}  kl={:.4}  {}", p.coefficient, p.kl_divergence, p.text);
    }
    println!("{} of {} coefficients changed the text", sweep.changed_points().count(), sweep.points.len());
    Ok(())
}
