use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("ActionCreator {0} is already registered")]
    AlreadyRegistered(String),

    #[error("no such action: {0}")]
    UnknownAction(String),

    #[error("cannot decode {action}: {source}")]
    Decode {
        action: String,
        #[source]
        source: loupe_protocol::CodecError,
    },

    #[error("store dispatcher is not running")]
    Closed,

    #[error("{0}")]
    Other(String),
}
