//! The crate's single error currency. Every fallible operation in the
//! public API returns `Result<T, Error>`; there is no `anyhow`-style boxed
//! error anywhere in this crate.

use cachemux_core::pool::PoolError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("pool exhausted: no connection became available within the timeout")]
    PoolExhausted,

    #[error("no valid connection could be created or validated")]
    NoValidObject,

    #[error("server is quarantined or its pool is closed")]
    PoolClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server returned status {0:?} for this request")]
    ServerStatus(crate::protocol::status::Status),

    #[error("no server is available to satisfy this request")]
    NoServerAvailable,

    #[error("config error: {0}")]
    Config(String),
}

impl From<PoolError<Error>> for Error {
    fn from(e: PoolError<Error>) -> Self {
        match e {
            PoolError::Exhausted => Error::PoolExhausted,
            PoolError::NoValidObject(inner) => inner,
            PoolError::Timeout => Error::Timeout,
            PoolError::Closed => Error::PoolClosed,
        }
    }
}
