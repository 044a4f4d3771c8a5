// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steer GPT-2 with a scope-bound forward hook.
//!
//! ```bash
//! cargo run --release --example forward_hook_steering
//! ```
//!
//! Derives a "Love" - "Hate" vector at the output of block 6, then injects
//! it on every forward evaluation while the handle is alive.  The block
//! output is a (hidden, present) pair; only the hidden state is shifted.
//!
//! On first run, downloads GPT-2 small (~550 MB) from `HuggingFace` Hub.

use candle_steer::{GenerationConfig, HookPoint, HookSpec, SteerModel, SteerTokenizer, SteeringVector};
use tracing_subscriber::EnvFilter;

fn main() -> candle_steer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let model_id = "openai-community/gpt2";
    println!("Loading {model_id}...");
    let model = SteerModel::from_pretrained(model_id)?;
    let tokenizer = SteerTokenizer::from_pretrained(model_id)?;

    let point = HookPoint::ResidPost(6);
    let love = SteeringVector::derive(&model, &tokenizer, point.clone(), "Love", "Hate")?;
    println!("Vector at {point}: raw norm {:.2}", love.raw_norm());

    let prompt = "I hate you because";
    let config = GenerationConfig::greedy(30).with_eos(tokenizer.eos_token_id());
    let hooks = HookSpec::new();

    let baseline = model.complete(&tokenizer, prompt, &config, &hooks)?;
    println!("\nbaseline: {}", baseline.full_text);

    // Coefficient in units of the raw difference norm.
    let coefficient = 5.0 * f64::from(love.raw_norm());
    {
        let _steer = model.inject(point, &love, coefficient)?;
        println!("active hooks: {}", model.active_hooks()?.len());
        let steered = model.complete(&tokenizer, prompt, &config, &hooks)?;
        println!("steered:  {}", steered.full_text);
    }

    let after = model.complete(&tokenizer, prompt, &config, &hooks)?;
    println!("after:    {}", after.full_text);
    println!("restored: {}", after.generated_tokens == baseline.generated_tokens);
    Ok(())
}
