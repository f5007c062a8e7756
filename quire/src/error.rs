use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    IOError(#[from] io::Error),
    #[error("could not encode metadata: {0}")]
    Encode(#[from] rmps::encode::Error),
    #[error("could not decode metadata: {0}")]
    Decode(#[from] rmps::decode::Error),
    #[error("term dictionary: {0}")]
    Fst(#[from] fst::Error),
    #[error("failed to obtain lock '{0}'")]
    LockObtainFailed(String),
    #[error("no committed index found")]
    IndexNotFound,
    #[error("field '{field}' was indexed with conflicting features")]
    FieldFeaturesMismatch { field: String },
    #[error("merge aborted")]
    MergeAborted,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("corrupted index: {0}")]
    Corrupted(String),
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn corrupted<S: Into<String>>(msg: S) -> Error {
        Error::Corrupted(msg.into())
    }

    pub fn illegal_state<S: Into<String>>(msg: S) -> Error {
        Error::IllegalState(msg.into())
    }
}
