// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caches for efficient autoregressive generation.
//!
//! - [`KVCache`]: per-layer key/value tensors from previous positions.

mod kv;

pub use kv::KVCache;
