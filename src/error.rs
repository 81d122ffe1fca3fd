use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendKind;

/// type alias for all operations against a [`Backend`](crate::Backend) that could fail with a
/// [`DbError`]
pub type Result<T> = std::result::Result<T, DbError>;

/// The error variants produced by the backend adapters, the dispatcher and the binaries.
///
/// Lower level errors from the client libraries are wrapped as-is, so the underlying message
/// survives all the way into the response trace.
#[derive(Debug, Error)]
pub enum DbError {
    /// the backend could not be reached (health check, connect or per-call network failure)
    #[error("{0} is unreachable: {1}")]
    Unavailable(BackendKind, String),

    /// the requested key or document does not exist
    #[error("key not found: {0}")]
    NotFound(String),

    /// an insert collided with an existing key
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// a query was rejected by the backend or built from invalid bounds
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// the backend has no native way of doing the requested thing
    #[error("{0} does not support {1}")]
    Unsupported(BackendKind, &'static str),

    /// a name or parameter given by the caller could not be parsed
    #[error("could not parse {0}")]
    Parsing(String),

    /// the key-value store answered with a non-success HTTP status
    #[error("unexpected status {status} from {url}")]
    Status {
        /// HTTP status code
        status: u16,
        /// the url that was requested
        url: String,
    },

    /// io error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// serde_json error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Redis client error
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// MongoDB driver error
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    /// error converting a record into a BSON document
    #[error(transparent)]
    Bson(#[from] mongodb::bson::ser::Error),

    /// catch-all for errors that carry nothing but a description
    #[error("{0}")]
    StringErr(String),
}

/// The coarse failure taxonomy reported to callers alongside the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// backend unreachable, at start-up or per call
    Connection,
    /// key or document absent
    NotFound,
    /// insert conflict
    DuplicateKey,
    /// search, aggregation or bounds rejected
    MalformedQuery,
    /// capability missing on this backend
    Unsupported,
    /// anything else
    Other,
}

impl DbError {
    /// maps this error onto the [`ErrorKind`] taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Unavailable(..) => ErrorKind::Connection,
            DbError::Io(e) if is_socket_error(e) => ErrorKind::Connection,
            DbError::Http(e) if e.is_connect() || e.is_timeout() => ErrorKind::Connection,
            DbError::Redis(e) if e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped() => {
                ErrorKind::Connection
            }
            DbError::Mongo(e) if matches!(*e.kind, mongodb::error::ErrorKind::ServerSelection { .. }) => {
                ErrorKind::Connection
            }
            DbError::NotFound(_) => ErrorKind::NotFound,
            DbError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            DbError::MalformedQuery(_) | DbError::Parsing(_) => ErrorKind::MalformedQuery,
            DbError::Unsupported(..) => ErrorKind::Unsupported,
            _ => ErrorKind::Other,
        }
    }
}

/// io errors that come from talking to a peer rather than from the local filesystem
fn is_socket_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind as Io;
    matches!(
        e.kind(),
        Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::AddrInUse
            | Io::AddrNotAvailable
            | Io::BrokenPipe
            | Io::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_errors_are_only_connection_errors_when_they_come_from_a_socket() {
        let refused = DbError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(refused.kind(), ErrorKind::Connection);

        let missing = DbError::from(io::Error::new(io::ErrorKind::NotFound, "poblacion.json"));
        assert_eq!(missing.kind(), ErrorKind::Other);
    }
}
