// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model download via [`hf-hub`](https://github.com/huggingface/hf-hub).
//!
//! Files land in the standard `HuggingFace` cache directory
//! (`~/.cache/huggingface/hub/`), so a model fetched once loads offline
//! afterwards.
//!
//! ```rust,no_run
//! # fn example() -> candle_steer::Result<()> {
//! let files = candle_steer::download_model("openai-community/gpt2")?;
//! tracing::info!("config at {}", files.config.display());
//!
//! let model = candle_steer::SteerModel::from_pretrained("openai-community/gpt2")?;
//! # let _ = model; Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use hf_hub::api::sync::{Api, ApiRepo};

use crate::error::{Result, SteerError};

/// Index file of sharded safetensors checkpoints.
const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Single-file safetensors checkpoint.
const SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Local paths of a downloaded model repository.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// `config.json`.
    pub config: PathBuf,
    /// `tokenizer.json`, if the repository ships one.
    pub tokenizer: Option<PathBuf>,
    /// Safetensors weight files (one, or every shard in index order).
    pub weights: Vec<PathBuf>,
}

/// Index structure for sharded safetensors models.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name to shard filename.
    weight_map: std::collections::HashMap<String, String>,
}

/// Open a model repository on the hub.
fn open_repo(model_id: &str) -> Result<ApiRepo> {
    let api = Api::new().map_err(|e| SteerError::Download(e.to_string()))?;
    Ok(api.model(model_id.to_owned()))
}

/// Fetch one file, reusing the local cache when present.
fn fetch(repo: &ApiRepo, model_id: &str, filename: &str) -> Result<PathBuf> {
    let path = repo
        .get(filename)
        .map_err(|e| SteerError::Download(format!("{model_id}/{filename}: {e}")))?;
    tracing::info!(model = model_id, file = filename, path = %path.display(), "file ready");
    Ok(path)
}

/// Download a single file from a model repository.
///
/// # Errors
///
/// Returns [`SteerError::Download`] if the file cannot be fetched.
pub fn download_file(model_id: &str, filename: &str) -> Result<PathBuf> {
    fetch(&open_repo(model_id)?, model_id, filename)
}

/// Download the config, tokenizer and weights of a model repository.
///
/// Sharded checkpoints are resolved through `model.safetensors.index.json`;
/// otherwise `model.safetensors` is fetched.
///
/// # Errors
///
/// Returns [`SteerError::Download`] if a required file cannot be fetched,
/// or [`SteerError::Config`] if the shard index is malformed.
pub fn download_model(model_id: &str) -> Result<ModelFiles> {
    let repo = open_repo(model_id)?;
    tracing::info!(model = model_id, "resolving model files");

    let config = fetch(&repo, model_id, "config.json")?;
    let tokenizer = fetch(&repo, model_id, "tokenizer.json").ok();

    let weights = match repo.get(SAFETENSORS_INDEX) {
        Ok(index_path) => {
            let index_str = std::fs::read_to_string(&index_path)?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)
                .map_err(|e| SteerError::Config(format!("parse {SAFETENSORS_INDEX}: {e}")))?;
            // BTreeSet: unique shard names in a stable order
            let shards: BTreeSet<String> = index.weight_map.into_values().collect();
            let mut paths = Vec::with_capacity(shards.len());
            for shard in &shards {
                paths.push(fetch(&repo, model_id, shard)?);
            }
            paths
        }
        Err(_) => vec![fetch(&repo, model_id, SAFETENSORS_SINGLE)?],
    };

    tracing::info!(model = model_id, shards = weights.len(), "model files ready");
    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}
