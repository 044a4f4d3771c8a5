// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steer GPT-2 by editing projection biases.
//!
//! ```bash
//! cargo run --release --example bias_edit_steering
//! ```
//!
//! The output of `ln_2` in block 6 is read only by the affine `c_fc`
//! projection, so adding `s` there equals adding `W s` to the `c_fc` bias.
//! The demo compares the edit against a forward-hook injection of the same
//! vector, then shows that a non-affine point is refused.

use candle_steer::{GenerationConfig, HookPoint, HookSpec, SteerModel, SteerTokenizer, SteeringVector};
use tracing_subscriber::EnvFilter;

fn main() -> candle_steer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let model_id = "openai-community/gpt2";
    let mut model = SteerModel::from_pretrained(model_id)?;
    let tokenizer = SteerTokenizer::from_pretrained(model_id)?;

    let point = HookPoint::MlpNorm(6);
    let vector = SteeringVector::derive(&model, &tokenizer, point.clone(), "Love", "Hate")?;
    let coefficient = 5.0 * f64::from(vector.raw_norm());

    let prompt = "I hate you because";
    let config = GenerationConfig::greedy(30).with_eos(tokenizer.eos_token_id());
    let hooks = HookSpec::new();

    let injected = model.with_injection(point.clone(), &vector, coefficient, |m| {
        m.complete(&tokenizer, prompt, &config, &hooks)
    })?;
    println!("injection: {}", injected.full_text);

    {
        let edited = model.edit_bias(point, &vector, coefficient)?;
        let out = edited.complete(&tokenizer, prompt, &config, &hooks)?;
        println!("bias edit: {}", out.full_text);
        println!("identical: {}", out.generated_tokens == injected.generated_tokens);
    }

    match model.edit_bias(HookPoint::ResidPost(6), &vector, coefficient) {
        Ok(_) => println!("unexpected: residual edit accepted"),
        Err(e) => println!("residual edit refused: {e}"),
    }

    let baseline = model.complete(&tokenizer, prompt, &config, &hooks)?;
    println!("baseline:  {}", baseline.full_text);
    Ok(())
}
