//! Error types for the flow engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error talking to {adapter}: {source}")]
    Connection {
        adapter: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("transient error on topic {topic}: {message}")]
    Transient { topic: String, message: String },

    #[error("fatal adapter error on topic {topic}: {message}")]
    Fatal { topic: String, message: String },

    #[error("shutdown timed out waiting for {stage} after {elapsed_ms}ms")]
    ShutdownTimeout { stage: String, elapsed_ms: u128 },

    #[error("unknown adapter type: {0}")]
    UnknownAdapter(String),

    #[error("unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("routing failed for message on topic {topic}: {reason}")]
    RoutingFailed { topic: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Error severity as seen by the calling stage, used to decide whether a
/// per-message failure should merely be counted, or whether the flow must
/// move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Counted on the relevant topic, message dropped, flow continues.
    Transient,
    /// The flow transitions to `Failed` and initiates shutdown.
    Fatal,
}

impl FlowError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FlowError::Fatal { .. } => ErrorSeverity::Fatal,
            _ => ErrorSeverity::Transient,
        }
    }
}
