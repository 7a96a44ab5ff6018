//! Typed error taxonomy for the runtime core.

use thiserror::Error;

/// Errors the runtime core itself produces (as opposed to ambient
/// integration failures, which travel as `anyhow::Error`).
#[derive(Error, Debug)]
pub enum MosaicError {
    #[error("mesh {0} already running")]
    AlreadyStarted(String),

    #[error("mesh {0} not running")]
    NotStarted(String),

    #[error("{0} not running")]
    NotRunning(String),

    #[error("broker stopped")]
    BrokerStopped,

    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    #[error("payload schema invalid for {event_type}: {reason}")]
    SchemaInvalid { event_type: String, reason: String },

    #[error("no connection from {source_node} to {target}")]
    NoConnection { source_node: String, target: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("mesh not running: {0}")]
    MeshNotRunning(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {0} already running")]
    NodeAlreadyRunning(String),

    #[error("driver failed: {0}")]
    DriverFailed(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
}

pub type MosaicResult<T> = Result<T, MosaicError>;
