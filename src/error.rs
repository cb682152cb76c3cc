use std::error::Error as StdError;
use std::fmt;

use serde_json::Error as JsonError;

use crate::internal::prelude::*;

/// The common result type between most library functions.
///
/// The library exposes functions which, for a result type, exposes only one
/// type, rather than the usual 2 (`Result<T, Error>`). This is because all
/// functions that return a result return shoal's [`Error`], so this is
/// implied, and a "simpler" result is used.
pub type Result<T> = StdResult<T, Error>;

/// A common error enum returned by most of the library's functionality.
#[derive(Debug)]
pub enum Error {
    /// An error from the `serde_json` crate, raised while encoding or
    /// decoding a persisted event or snapshot.
    Json(JsonError),
    /// The journal failed to append an event or store a snapshot. The
    /// attempted write may or may not have reached the log.
    Journal(String),
    /// A protocol inconsistency that can not be recovered from locally,
    /// such as a shard's home moving away from this region without a
    /// handoff. The unit raising this stops itself.
    IllegalState(String),
    /// Some other error.
    Other(&'static str),
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Json(inner) => fmt::Display::fmt(inner, f),
            Error::Journal(msg) => write!(f, "journal failure: {msg}"),
            Error::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Json(inner) => Some(inner),
            _ => None,
        }
    }
}
