// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-steer
//!
//! Activation steering for language models in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! candle-steer re-implements transformer forward passes with named hook
//! points (following the `TransformerLens` naming), and steers generation
//! by adding a scaled direction to the activation at one point:
//!
//! 1. Capture the activation at a point for two contrastive prompts and
//!    derive a unit-norm [`SteeringVector`] from their last positions.
//! 2. Inject `coefficient * vector` at the point on every forward
//!    evaluation, including each decoding step of
//!    [`SteerModel::generate`], through a scope-bound [`HookHandle`].
//! 3. Or fold the same shift into the biases of the affine projections
//!    that read a norm output, through a scope-bound [`BiasEdit`].
//!
//! ```no_run
//! use candle_steer::{GenerationConfig, HookPoint, HookSpec, SteerModel, SteerTokenizer, SteeringVector};
//!
//! # fn main() -> candle_steer::Result<()> {
//! let model = SteerModel::from_pretrained("openai-community/gpt2")?;
//! let tok = SteerTokenizer::from_pretrained("openai-community/gpt2")?;
//!
//! let point = HookPoint::ResidPost(6);
//! let love = SteeringVector::derive(&model, &tok, point.clone(), "Love", "Hate")?;
//!
//! let config = GenerationConfig::greedy(20);
//! let steered = model.with_injection(point, &love, 8.0, |m| {
//!     m.complete(&tok, "I hate you because", &config, &HookSpec::new())
//! })?;
//! println!("{}", steered.full_text);
//! # Ok(())
//! # }
//! ```
//!
//! ## Supported models
//!
//! One generic transformer covers GPT-2, `LLaMA`, `Qwen2`, Gemma, Gemma 2,
//! `Phi-3`, `StarCoder2` and Mistral via configuration axes.

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod generation;
pub mod hooks;
pub mod steering;
pub mod tokenizer;
pub mod transformer;
pub mod util;

pub use backend::{BiasSnapshot, SteerBackend, SteerModel};
pub use cache::KVCache;
pub use config::TransformerConfig;
pub use download::{ModelFiles, download_file, download_model};
pub use error::{Result, SteerError};
pub use generation::{DecodingMode, GenerationConfig, GenerationResult};
pub use hooks::{
    HookCache, HookFn, HookHandle, HookId, HookPoint, HookSpec, HookValue, Intervention,
    OutputKind, Trace, TraceOptions,
};
pub use steering::{BiasEdit, CoefficientSweep, STANDARD_COEFFICIENTS, SteeringVector, SweepPoint};
pub use tokenizer::SteerTokenizer;
pub use transformer::GenericTransformer;
