//! Pretrained encoder download and initialisation.

use std::path::PathBuf;

use candle_core::Device;
use causalbert_core::{CausalBertError, ModelConfig, Result};

use crate::model::CausalBert;
use crate::tokenizer::HfTokenizer;

/// Files fetched from the model repository.
#[derive(Debug, Clone)]
pub struct PretrainedFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

/// Download (or reuse from cache) the files of `config.model_id`.
pub async fn fetch_pretrained(config: &ModelConfig) -> Result<PretrainedFiles> {
    use hf_hub::api::tokio::{Api, ApiBuilder};

    let api = match &config.cache_dir {
        Some(dir) => ApiBuilder::new().with_cache_dir(dir.clone()).build(),
        None => Api::new(),
    }
    .map_err(|e| CausalBertError::Model(format!("Failed to create HF API client: {e}")))?;

    let repo = api.model(config.model_id.clone());

    let config_path = repo
        .get("config.json")
        .await
        .map_err(|e| CausalBertError::Model(format!("Failed to download config.json: {e}")))?;
    let tokenizer_path = repo.get("tokenizer.json").await.map_err(|e| {
        CausalBertError::Model(format!("Failed to download tokenizer.json: {e}"))
    })?;
    let weights_path = repo.get("model.safetensors").await.map_err(|e| {
        CausalBertError::Model(format!("Failed to download model.safetensors: {e}"))
    })?;

    Ok(PretrainedFiles {
        config: config_path,
        tokenizer: tokenizer_path,
        weights: weights_path,
    })
}

/// Build a BERT-backed [`CausalBert`] seeded from local pretrained files.
///
/// The heads that the checkpoint does not cover (propensity, outcome, and
/// the MLM transform for encoder-only checkpoints) keep their random
/// initialisation.
pub fn load_pretrained(
    config: ModelConfig,
    files: &PretrainedFiles,
    device: &Device,
) -> Result<(CausalBert, HfTokenizer)> {
    let config_str = std::fs::read_to_string(&files.config)?;
    let config_json: serde_json::Value = serde_json::from_str(&config_str)?;

    let model_type = config_json
        .get("model_type")
        .and_then(|v| v.as_str())
        .unwrap_or("bert");
    if model_type != "bert" {
        tracing::warn!(model_type, "Encoder is not a BERT checkpoint; loading may fail");
    }

    let tokenizer = HfTokenizer::from_file(&files.tokenizer)?;
    check_mask_token(&config, &tokenizer)?;
    let model = CausalBert::bert(config, &config_json, device)?;
    let report = model.store().seed_from_pretrained(&files.weights)?;

    tracing::info!(
        model_type,
        loaded = report.loaded,
        missing = report.missing.len(),
        vocab = tokenizer.vocab_size(),
        "Pretrained CausalBert ready"
    );
    Ok((model, tokenizer))
}

/// `config.mask_token_id` must be the tokenizer's `[MASK]` id when it has one.
pub fn check_mask_token(config: &ModelConfig, tokenizer: &HfTokenizer) -> Result<()> {
    match tokenizer.token_id("[MASK]") {
        Some(id) if id != config.mask_token_id => Err(CausalBertError::Config(format!(
            "mask_token_id {} does not match the tokenizer's [MASK] id {id}",
            config.mask_token_id
        ))),
        Some(_) => Ok(()),
        None => {
            tracing::warn!(
                mask_token_id = config.mask_token_id,
                "Tokenizer has no [MASK] token; using the configured id"
            );
            Ok(())
        }
    }
}

/// Download and load `config.model_id` in one step.
pub async fn from_pretrained(
    config: ModelConfig,
    device: &Device,
) -> Result<(CausalBert, HfTokenizer)> {
    tracing::info!(model_id = %config.model_id, "Fetching pretrained encoder");
    let files = fetch_pretrained(&config).await?;
    load_pretrained(config, &files, device)
}
