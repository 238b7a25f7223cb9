//! Error types for the email worker.

use thiserror::Error;

/// Startup and lifecycle errors.
///
/// Only these abort the process. Per-delivery failures are classified and
/// recovered inside the consumer and never surface here.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// AMQP connection or channel error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Passive declaration failed: the queue does not exist or is not accessible
    #[error("Queue [{queue}] is not available: {source}")]
    QueueNotFound {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failure of an acknowledgment call against the broker channel.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The channel or connection is no longer open.
    #[error("channel is closed: {0}")]
    Closed(String),

    /// Any other broker-side failure.
    #[error("broker error: {0}")]
    Other(String),
}

impl TransportError {
    /// Classify a lapin error into closed vs. other.
    pub fn from_lapin(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_) => TransportError::Closed(err.to_string()),
            other => TransportError::Other(other.to_string()),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed(_))
    }
}

/// Failure of the confirmation-send unit of work.
#[derive(Error, Debug)]
pub enum SendError {
    /// The broker transport went away while the task was being processed.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Anything else. Reported with full detail, message left unsettled.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
