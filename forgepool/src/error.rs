//! Common error types for forgepool.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

/// Main error type for forgepool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream node RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Block template errors (missing fields, algo mismatch)
    #[error("Template error: {0}")]
    Template(String),

    /// Job construction errors (coinbase overflow, bad template bytes)
    #[error("Job construction error: {0}")]
    Job(String),

    /// Hex/varint/script encoding errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] crate::encoding::EncodingError),

    /// Difficulty/target arithmetic errors
    #[error("Target error: {0}")]
    Target(#[from] crate::target::TargetError),

    /// Stratum protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// API errors
    #[error("API error: {0}")]
    Api(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
