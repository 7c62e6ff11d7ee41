use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode event for broadcast: {0}")]
    Encode(#[from] serde_json::Error),
}
