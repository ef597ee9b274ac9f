//! Omnicron server error types.

use omnicron_core::error::DomainError;
use thiserror::Error;

/// Startup errors for the server binary.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Network binding or I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),

    /// Journal provisioning failed.
    #[error("journal error: {0}")]
    Domain(#[from] DomainError),
}
