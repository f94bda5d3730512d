use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    cache::{FetchError, MutationError},
    domain::error::DomainError,
    infra::error::InfraError,
};

use super::repos::StoreError;

/// Error message chain captured for operator-facing output.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }

    pub fn from_message(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            source,
            messages: vec![message.into()],
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session prefetch of {key} failed; gate stays closed")]
    Prefetch {
        key: String,
        #[source]
        source: FetchError,
    },
    #[error("session ended while its prefetch was running")]
    Superseded,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Session(#[from] SessionError),
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

    /// Process exit code for the operator CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => 2,
            AppError::Infra(InfraError::Configuration { .. }) => 3,
            AppError::Infra(_) | AppError::Store(_) => 4,
            AppError::Fetch(_) | AppError::Mutation(_) | AppError::Session(_) => 5,
            AppError::Domain(DomainError::Invariant { .. }) | AppError::Unexpected(_) => 1,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }
}
