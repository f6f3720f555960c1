//! Module `error` implements the error taxonomy shared by every layer of
//! the driver stack: variant container, storage backends, pull protocol,
//! and facade.
//!
//! Errors are intentionally a flat enum of seven kinds rather than one
//! variant per failing call site; callers branch on the kind, and the
//! attached message carries whatever context the failing operation had.

use std::{fmt, io, result};

/// Crate-wide result alias.
pub type Result<T> = result::Result<T, Error>;

/// The seven-kind error taxonomy. Every public API returns one of these
/// instead of panicking or raising; no exception crosses the facade
/// boundary.
#[derive(Debug)]
pub enum Error {
    /// success is represented by `Ok(..)`, this variant never appears.
    /// Target record or required query field is absent.
    NoData(String),
    /// Malformed query, bad id hex, wrong variant shape, unknown driver
    /// name, or missing required configuration.
    InvalidArguments(String),
    /// A consistency invariant was violated at runtime, e.g. a master
    /// row's vector text failed to deserialize during a pull.
    AssertionFailure(String),
    /// I/O, SQL, KV, decoding, or memory-map failure.
    SystemError(String),
    /// Operation unsupported by the active driver/storage combination.
    NotImplemented(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoData(msg) => write!(f, "no-data: {}", msg),
            Error::InvalidArguments(msg) => write!(f, "invalid-arguments: {}", msg),
            Error::AssertionFailure(msg) => write!(f, "assertion-failure: {}", msg),
            Error::SystemError(msg) => write!(f, "system-error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "not-implemented: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::SystemError(format!("io: {}", err))
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Error {
        Error::SystemError(format!("sled: {}", err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Error {
        Error::InvalidArguments(format!("yaml: {}", err))
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Error {
        Error::SystemError(format!("int-conversion: {}", err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Error {
        Error::SystemError(format!("sqlite3: {}", err))
    }
}

impl From<postgres::Error> for Error {
    fn from(err: postgres::Error) -> Error {
        Error::SystemError(format!("pgsql: {}", err))
    }
}

impl From<mysql::Error> for Error {
    fn from(err: mysql::Error) -> Error {
        Error::SystemError(format!("mysql: {}", err))
    }
}

/// Construct an [`Error`] tagged with `file:line`, so every surfaced
/// error is traceable back to its call site the same way the facade's
/// log lines carry `file:line:function`.
///
/// ```ignore
/// return Err(err_at!(NoData, "id {} not found in store", hex));
/// ```
#[macro_export]
macro_rules! err_at {
    ($variant:ident, $msg:expr) => {{
        let loc = format!("{}:{}", file!(), line!());
        $crate::Error::$variant(format!("{} [{}]", $msg, loc))
    }};
    ($variant:ident, $fmt:expr, $($arg:expr),+ $(,)?) => {{
        let loc = format!("{}:{}", file!(), line!());
        $crate::Error::$variant(format!("{} [{}]", format!($fmt, $($arg),+), loc))
    }};
}
