//! Error types for Authguard.

use thiserror::Error;

use crate::ratelimit::IdentitySource;

/// Main error type for Authguard operations.
///
/// Running out of quota is not represented here; that is an ordinary
/// `false` decision from the limiter.
#[derive(Error, Debug)]
pub enum AuthguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy definition that violates its invariants
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// A policy name that is not configured on the limiter
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// The caller did not carry the identity the policy is keyed on
    #[error("Policy '{policy}' is keyed by {identity} but the caller has none")]
    MissingIdentity {
        policy: String,
        identity: IdentitySource,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Authguard operations.
pub type Result<T> = std::result::Result<T, AuthguardError>;
