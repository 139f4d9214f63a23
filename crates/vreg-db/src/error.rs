//! Database error types

use sqlx::error::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(sqlx::Error),

    /// A UNIQUE index rejected the write. Callers decide whether to retry.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Check constraint violated: {0}")]
    CheckViolation(String),

    #[error("Invalid stored value: {0}")]
    Decode(String),
}

impl DbError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DbError::UniqueViolation(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.kind() {
                ErrorKind::UniqueViolation => {
                    return DbError::UniqueViolation(db_err.message().to_string());
                }
                ErrorKind::CheckViolation => {
                    return DbError::CheckViolation(db_err.message().to_string());
                }
                _ => {}
            }
        }
        DbError::Connection(err)
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Decode(err.to_string())
    }
}
