//! Error types for the Orderguard limiter.

use thiserror::Error;

/// Main error type for Orderguard operations.
#[derive(Error, Debug)]
pub enum OrderGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The host recognizes no order types, so qualifying orders cannot be counted yet
    #[error("No order types were found")]
    EmptyOrderTypes,

    /// Checkout was refused because the client reached its order limit
    #[error("Orders not accepted: {0}")]
    OrdersNotAccepted(String),

    /// Order store query failures
    #[error("Order store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Orderguard operations.
pub type Result<T> = std::result::Result<T, OrderGuardError>;
