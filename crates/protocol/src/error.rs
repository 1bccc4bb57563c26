use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid codec `{0}`; expected one of json, cbor, msgpack")]
    UnknownCodec(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR error: {0}")]
    Cbor(String),

    #[error("MessagePack error: {0}")]
    Msgpack(String),

    #[error("{0}")]
    Other(String),
}

impl<E: std::fmt::Debug> From<ciborium::de::Error<E>> for CodecError {
    fn from(err: ciborium::de::Error<E>) -> Self {
        Self::Cbor(format!("{err:?}"))
    }
}

impl<E: std::fmt::Debug> From<ciborium::ser::Error<E>> for CodecError {
    fn from(err: ciborium::ser::Error<E>) -> Self {
        Self::Cbor(format!("{err:?}"))
    }
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Msgpack(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Msgpack(err.to_string())
    }
}
