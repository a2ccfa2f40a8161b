//! Common error types for Mimik

use thiserror::Error;

/// Common result type for Mimik operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared between the engine and embedding shells
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
