/// Errors of the `utxo-commit` tool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Commitment(#[from] subcoin_utxo_commitment::Error),

    #[error(transparent)]
    Storage(#[from] subcoin_utxo_storage::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Input(String),
}

pub type Result<T> = std::result::Result<T, Error>;
