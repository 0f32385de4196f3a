use thiserror::Error;

/// Crate-wide error taxonomy. Each variant groups a class of failure
/// rather than a single call site; callers match on the variant to
/// decide whether to retry, surface to a user, or abort a batch.
#[derive(Error, Debug)]
pub enum SeglakeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("concurrency error: {0}")]
    Concurrency(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("sql: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("http: {0}")]
    Http(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SeglakeError>;

impl SeglakeError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SeglakeError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SeglakeError::NotFound(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        SeglakeError::Integrity(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        SeglakeError::Concurrency(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        SeglakeError::Configuration(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        SeglakeError::Fatal(msg.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        SeglakeError::Http(msg.into())
    }

    /// True for the transient-I/O category that may be retried
    /// at the call sites that choose to (SQL busy, network timeout).
    pub fn is_transient(&self) -> bool {
        match self {
            SeglakeError::Sql(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked
            }
            SeglakeError::Http(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SeglakeError {
    fn from(e: reqwest::Error) -> Self {
        SeglakeError::Http(e.to_string())
    }
}
