use thiserror::Error;

/// Errors raised by the codec and merge layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Bytes that are not well-formed for the type they are declared as.
    #[error("marshal: {0}")]
    Marshal(String),

    /// Corrupt, truncated or version-incompatible on-disk structure.
    #[error("decoding: {0}")]
    Decoding(String),

    /// Schema change rejected before anything was applied.
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("scanned over {scanned} tombstones; query aborted")]
    TombstoneOverwhelming { scanned: usize },

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn marshal<S: Into<String>>(msg: S) -> Self {
        Error::Marshal(msg.into())
    }

    pub(crate) fn decoding<S: Into<String>>(msg: S) -> Self {
        Error::Decoding(msg.into())
    }

    pub(crate) fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
