//! Error types for the binding engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Expected domain conditions such as
//! pool exhaustion or a missing binding are not errors; they surface as
//! `Ok(None)` from the manager operations.

use std::net::IpAddr;

/// Errors that can occur while building or running the binding engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (config or lease files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid engine configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) and by the
    /// pool constructors when a pool range is inverted, mixes address
    /// families, overlaps another pool, or has an allocation length shorter
    /// than its prefix length. Fatal at startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A request referenced a link that is not configured.
    #[error("Unknown link: {0}")]
    UnknownLink(String),

    /// The lease store refused to record an address because another
    /// identity still holds it.
    #[error("Address {0} is held by another client")]
    AddressConflict(IpAddr),

    /// Any other lease store failure.
    #[error("Lease store error: {0}")]
    Store(String),
}

/// A specialized Result type for binding engine operations.
pub type Result<T> = std::result::Result<T, Error>;
