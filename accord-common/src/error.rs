use bincode;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum AccordError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Bincode Error: {0}")]
    Bincode(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Node {0} is shut down")]
    Shutdown(u64),
}

pub type Result<T> = std::result::Result<T, AccordError>;

impl From<bincode::Error> for AccordError {
    fn from(err: bincode::Error) -> Self {
        AccordError::Bincode(err.to_string())
    }
}
