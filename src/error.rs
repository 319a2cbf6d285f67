//! Error type shared by the library modules.

/// Errors raised while preparing data, collating batches or training.
#[derive(Debug, thiserror::Error)]
pub enum RewardError {
    /// A record handed to the collator lacks one of the required token fields.
    #[error("missing required field `{0}`")]
    MissingField(String),
    /// Sequences that must line up (ids vs. mask, or rows of a batch) do not.
    #[error("shape mismatch in `{field}`: {reason}")]
    ShapeMismatch { field: String, reason: String },
    /// Candle tensor error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// HTTP error while talking to the datasets server.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Error fetching files from the model hub.
    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
    /// Tokenizer failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
    /// A dataset or split ended up with no examples.
    #[error("empty dataset: {0}")]
    EmptyDataset(String),
}

/// Result type for reward modeling operations.
pub type Result<T> = std::result::Result<T, RewardError>;
