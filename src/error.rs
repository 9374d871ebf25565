use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("store i/o failed: {message}")]
    StoreIo { message: String },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("i/o pool was shut down")]
    ShutDown,
    #[error("write-back worker dropped the result of tile {0}")]
    WorkerLost(String),
    #[error("could not start i/o thread {0}")]
    WorkerSpawn(String),
}

impl Error {
    pub fn store_io(message: impl Into<String>) -> Self {
        Error::StoreIo {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
