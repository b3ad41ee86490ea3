use thiserror::Error;

use crate::{
    cache::{KeyError, QueryError},
    config::LoadError,
    infra::error::InfraError,
};

/// Top-level error for the command-line front end.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit status: 2 for bad input, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_)
            | Self::Key(_)
            | Self::Validation(_)
            | Self::Query(QueryError::MissingIdentity(_)) => 2,
            Self::Infra(_) | Self::Query(QueryError::Backend(_)) | Self::Unexpected(_) => 1,
        }
    }
}
