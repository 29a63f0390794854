use thiserror::Error;

/// Errors surfaced by the persistence core.
///
/// Each variant is a stable kind that callers branch on. Adapters add
/// context to the message but never change the kind.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Credential renewal exhausted: {0}")]
    FatalCredential(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Blob store error: {0}")]
    Blob(String),
}

/// Coarse status a transport layer maps onto its own response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotFound,
    Conflict,
    BadRequest,
    Unavailable,
    Internal,
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::DuplicateRecord(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn blob(msg: impl Into<String>) -> Self {
        Self::Blob(msg.into())
    }

    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::DuplicateRecord(_) => Status::Conflict,
            Self::Validation(_) => Status::BadRequest,
            Self::Connection(_) => Status::Unavailable,
            Self::FatalCredential(_) | Self::Storage(_) | Self::Blob(_) => Status::Internal,
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Prefix the message with the failing operation, keeping the kind.
    pub fn context(self, op: &str) -> Self {
        match self {
            Self::NotFound(m) => Self::NotFound(format!("{}: {}", op, m)),
            Self::DuplicateRecord(m) => Self::DuplicateRecord(format!("{}: {}", op, m)),
            Self::Connection(m) => Self::Connection(format!("{}: {}", op, m)),
            Self::Validation(m) => Self::Validation(format!("{}: {}", op, m)),
            Self::FatalCredential(m) => Self::FatalCredential(format!("{}: {}", op, m)),
            Self::Storage(m) => Self::Storage(format!("{}: {}", op, m)),
            Self::Blob(m) => Self::Blob(format!("{}: {}", op, m)),
        }
    }
}

// SQLite extended result codes for PRIMARY KEY and UNIQUE constraint failures
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || matches!(
                        db.code().as_deref(),
                        Some(SQLITE_CONSTRAINT_PRIMARYKEY) | Some(SQLITE_CONSTRAINT_UNIQUE)
                    ) =>
            {
                Self::DuplicateRecord(db.message().to_string())
            }
            sqlx::Error::Io(e) => Self::Connection(e.to_string()),
            sqlx::Error::Tls(e) => Self::Connection(e.to_string()),
            sqlx::Error::PoolTimedOut => Self::Connection("connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => Self::Connection("connection pool closed".to_string()),
            sqlx::Error::WorkerCrashed => {
                Self::Connection("connection worker crashed".to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

// MongoDB server error code for a duplicate key on a unique index
const MONGO_DUPLICATE_KEY: i32 = 11000;

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == MONGO_DUPLICATE_KEY => {
                Self::DuplicateRecord(we.message.clone())
            }
            ErrorKind::Command(ce) if ce.code == MONGO_DUPLICATE_KEY => {
                Self::DuplicateRecord(ce.message.clone())
            }
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. } => Self::Connection(err.to_string()),
            ErrorKind::InvalidArgument { .. } => Self::Validation(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<bson::de::Error> for StoreError {
    fn from(err: bson::de::Error) -> Self {
        Self::Storage(format!("malformed document: {}", err))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Storage(format!("background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            StoreError::not_found("report abc").to_string(),
            "Not found: report abc"
        );
        assert_eq!(
            StoreError::duplicate("abc").to_string(),
            "Duplicate record: abc"
        );
        assert_eq!(
            StoreError::FatalCredential("3 attempts".into()).to_string(),
            "Credential renewal exhausted: 3 attempts"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(StoreError::not_found("x").status(), Status::NotFound);
        assert_eq!(StoreError::duplicate("x").status(), Status::Conflict);
        assert_eq!(StoreError::validation("x").status(), Status::BadRequest);
        assert_eq!(StoreError::connection("x").status(), Status::Unavailable);
        assert_eq!(StoreError::storage("x").status(), Status::Internal);
        assert_eq!(StoreError::blob("x").status(), Status::Internal);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = StoreError::duplicate("id abc").context("save run");
        assert!(matches!(err, StoreError::DuplicateRecord(_)));
        assert_eq!(err.to_string(), "Duplicate record: save run: id abc");

        let err = StoreError::connection("refused").context("ping");
        assert!(err.is_transient());
    }

    #[test]
    fn test_sqlx_classification() {
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolClosed),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::ColumnNotFound("fqdn".into())),
            StoreError::Storage(_)
        ));
    }
}
