use thiserror::Error;

/// Failures raised by the rules engine and its SQLite loaders.
///
/// Degenerate inputs (missing department, no graded subjects) are not errors;
/// they produce zero-valued results.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Invalid(_) => "bad_params",
            Self::Db(_) => "db_query_failed",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
