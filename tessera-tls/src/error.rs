use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while configuring TLS support
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS support is unavailable: no usable provider library was found")]
    Unavailable,

    #[error("A default TLS identity is already configured")]
    AlreadyConfigured,

    #[error("Invalid certificate template '{0}': expected at most one '%s' marker")]
    InvalidTemplate(String),

    #[error("Failed to create TLS context")]
    ContextCreation,

    #[error(
        "Cannot read valid certificate from {}. Check file permissions and file format.",
        .0.display()
    )]
    NoUsableCertificate(PathBuf),

    #[error("Cannot read valid certificate from descriptor: {0}")]
    InvalidIdentity(String),

    #[error("Failed to register SNI callback with the TLS provider")]
    SniRegistration,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TlsError>;
