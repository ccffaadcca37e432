use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Tap not found: {0}")]
    TapNotFound(String),

    #[error("No free /{prefix} subnet left in {pool}")]
    SubnetExhausted { pool: String, prefix: u8 },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
