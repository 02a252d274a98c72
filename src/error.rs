use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Query callers can match on the variant to tell
/// a missing entity apart from a broken store or a flaky upstream feed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no stops within walking range of start or end")]
    NoReachableStops,

    #[error("no journey found between the given coordinates")]
    NoRouteFound,

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for failures that may clear up on retry (network, upstream).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Http(_))
    }
}
