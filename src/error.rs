//! Error type shared by every record-stream operation

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("text record error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record after {consumed} bytes: {reason}")]
    Corrupt { consumed: u64, reason: String },

    /// A stream that must be ascending by id went backwards.
    #[error("{stream} is not sorted by id: {current} follows {previous}")]
    UnsortedInput {
        stream: &'static str,
        previous: i64,
        current: i64,
    },

    #[error("pipe did not drain within {retries} retries ({pending} bytes pending)")]
    DrainTimeout { retries: u32, pending: usize },

    #[error("pipe is closed")]
    PipeClosed,

    #[error("self references did not converge at level {level}: {references} references remain")]
    NonConvergent { level: usize, references: u64 },
}

impl StreamError {
    /// Attach the offending path to a bare I/O error.
    pub fn at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StreamError::IoAt {
            path: path.into(),
            source,
        }
    }
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            StreamError::IoAt { source, .. } => source,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
