use common::Transport;
use thiserror::Error;

/// Failure reported by a [`SampleSource`](crate::SampleSource).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("no device found via {0}")]
    NotFound(Transport),

    #[error("device refused configuration: {0}")]
    Configuration(String),

    #[error("device fault: {0}")]
    Fault(String),

    #[error("source used out of order: {0}")]
    State(String),
}

#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// The device could not be opened, configured or started.
    #[error("belt connection via {transport} failed: {source}")]
    ConnectionFailure {
        transport: Transport,
        #[source]
        source: SourceError,
    },

    #[error("acquisition is already running; stop it before starting again")]
    AlreadyStarted,

    #[error("invalid belt settings: {0}")]
    InvalidSettings(String),

    #[error("failed to spawn belt reader thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl AcquisitionError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, AcquisitionError::ConnectionFailure { .. })
    }
}
