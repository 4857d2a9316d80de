use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

// Errors that end a worker or refuse a lifecycle request. Per-flow problems
// never show up here, the workers recover from those locally.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed packet: {0}")]
    Parse(#[from] ParseError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tunnel device closed")]
    DeviceClosed,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("worker {0} panicked")]
    WorkerPanicked(&'static str),
}

// Reasons a buffer read from the device could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("buffer of {provided} bytes is shorter than the {minimum} byte header")]
    Truncated { provided: usize, minimum: usize },

    #[error("ip version {0} is not supported")]
    UnsupportedVersion(u8),

    #[error("invalid ihl {0}")]
    InvalidIhl(u8),

    #[error("total length {total} is smaller than header length {header}")]
    InvalidTotalLength { total: usize, header: usize },

    #[error("invalid tcp data offset {0}")]
    InvalidDataOffset(u8),
}
