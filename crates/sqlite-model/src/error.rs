use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to open database: {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// An SQL statement failed; the offending statement text is kept for
    /// diagnostics. No transient-vs-fatal classification, no retry.
    #[error("sql error: {source}: {sql}")]
    Sql {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("transaction state error: {0}")]
    TransactionState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Attach statement text to a driver error.
    pub(crate) fn sql(sql: impl Into<String>, source: rusqlite::Error) -> Self {
        DbError::Sql {
            sql: sql.into(),
            source,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
