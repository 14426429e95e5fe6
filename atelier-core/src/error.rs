use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while bringing a pipeline up. The model
/// handler absorbs these into its "no pipeline" state rather than
/// propagating them to callers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("failed to fetch model files: {0}")]
    Hub(#[from] hf_hub::api::tokio::ApiError),
    #[error("failed to load tokenizer: {0}")]
    Tokenizer(anyhow::Error),
    #[error("failed to build model: {0}")]
    Model(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-request failures. An unparsable seed is deliberately not in here:
/// it is recovered by running unseeded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GenerateError {
    #[error("no pipeline is loaded")]
    PipelineNotReady,
    #[error("inference failed: {0}")]
    Inference(anyhow::Error),
    #[error("failed to save image to {}: {}", .path.display(), .source)]
    Save {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
