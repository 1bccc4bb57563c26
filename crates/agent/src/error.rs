use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("codec error: {0}")]
    Codec(#[from] loupe_protocol::CodecError),

    #[error("store error: {0}")]
    Store(#[from] loupe_store::StoreError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}
