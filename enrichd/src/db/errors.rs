//! Database-level error categorization, shared by every repository in `db::handlers`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("entity not found")]
    NotFound,

    #[error("unique constraint violation")]
    UniqueViolation { constraint: Option<String>, table: Option<String>, message: String },

    #[error("foreign key constraint violation")]
    ForeignKeyViolation { constraint: Option<String>, table: Option<String>, message: String },

    #[error("check constraint violation")]
    CheckViolation { constraint: Option<String>, table: Option<String>, message: String },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DbError::UniqueViolation {
                        constraint: db_err.constraint().map(str::to_string),
                        table: db_err.table().map(str::to_string),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_foreign_key_violation() {
                    DbError::ForeignKeyViolation {
                        constraint: db_err.constraint().map(str::to_string),
                        table: db_err.table().map(str::to_string),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_check_violation() {
                    DbError::CheckViolation {
                        constraint: db_err.constraint().map(str::to_string),
                        table: db_err.table().map(str::to_string),
                        message: db_err.message().to_string(),
                    }
                } else {
                    DbError::Other(anyhow::Error::from(err))
                }
            }
            _ => DbError::Other(anyhow::Error::from(err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
