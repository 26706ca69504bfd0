use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while ingesting a trace archive or unifying definitions.
///
/// `Io`, `Inconsistent` and `Protocol` abort the whole run; the remaining
/// variants identify the offending record or identifier so the failure can
/// be reported precisely.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed trace data: {0}")]
    Malformed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown {category} identifier {id}")]
    UnknownId { category: &'static str, id: u32 },

    #[error("unbalanced ENTER/EXIT events ({0})")]
    Unbalanced(&'static str),

    #[error("inconsistent trace data: {0}")]
    Inconsistent(String),

    #[error("transport error: {0}")]
    Protocol(String),
}

impl TraceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TraceError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
