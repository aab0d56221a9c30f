use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Empty message content")]
    EmptyContent,

    #[error("Message content too large: {size} bytes (max {max})")]
    ContentTooLarge { size: usize, max: usize },
}
