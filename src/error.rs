use thiserror::Error;

/// Unified error type for the worker.
///
/// Collaborator errors (IMAP, TLS, SMTP) are wrapped as strings because the
/// underlying library types are not `Clone`/`Serialize` and we only ever
/// report them upward. Database errors keep their source so the processor
/// can inspect constraint violations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("network error: {0}")]
    Net(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("account invalid: {0}")]
    AccountInvalid(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task rejected: {0}")]
    TaskRejected(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn imap(err: impl std::fmt::Display) -> Self {
        SyncError::Imap(err.to_string())
    }

    pub fn net(err: impl std::fmt::Display) -> Self {
        SyncError::Net(err.to_string())
    }

    pub fn parse(err: impl std::fmt::Display) -> Self {
        SyncError::Parse(err.to_string())
    }

    /// Whether the sync loop should sleep and retry, rather than give up.
    ///
    /// Connection drops and transient IMAP failures are retryable; bad
    /// credentials, malformed data and database failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Imap(_) | SyncError::Net(_) | SyncError::Io(_)
        )
    }

    /// True when the failed insert hit a UNIQUE/PRIMARY KEY constraint.
    /// The message upsert path turns exactly this error into an update.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            SyncError::Db(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}
