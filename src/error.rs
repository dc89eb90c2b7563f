use thiserror::Error;

/// Result type alias for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Error types for the tunnel supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// SSH connection errors
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Network connection errors
    #[error("Network error: {0}")]
    Network(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel management errors
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Unknown tunnel name referenced by a command
    #[error("No such tunnel: {0}")]
    UnknownTunnel(String),

    /// Timeout errors
    #[error("Operation timed out")]
    Timeout,

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl From<russh::Error> for SupervisorError {
    fn from(err: russh::Error) -> Self {
        SupervisorError::Ssh(err.to_string())
    }
}

impl From<eyre::Error> for SupervisorError {
    fn from(err: eyre::Error) -> Self {
        SupervisorError::Other(err.to_string())
    }
}
