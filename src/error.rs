// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-steer.

/// Errors that can occur while loading, hooking, or steering a model.
#[derive(Debug, thiserror::Error)]
pub enum SteerError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook attachment, capture lookup, or callback error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Steering vector derivation, injection, or bias edit error.
    #[error("steering error: {0}")]
    Steering(String),

    /// Model configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model download or hub cache resolution error.
    #[error("download error: {0}")]
    Download(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-steer operations.
pub type Result<T> = std::result::Result<T, SteerError>;
