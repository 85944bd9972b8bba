//! Error types for the export pipeline

use std::any::Any;
use std::fmt;

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Debug)]
pub enum ExportError {
    /// The scratch buffer has no room for the next write
    BufferExhausted { requested: usize, capacity: usize },

    /// A producer failed while writing into the batch
    Producer { producer: String, message: String },

    /// HTTP request failed
    Http(reqwest::Error),

    /// Transmission was rejected or could not complete
    Transport(String),

    /// The export cycle was cancelled by the caller
    Cancelled,

    /// The export cycle ran past its timeout
    TimedOut,

    /// Configuration error
    Config(String),

    /// Scheduler lifecycle error
    SchedulerState(String),

    /// A producer or exporter panicked; the batch was abandoned
    Panicked { source: String, message: String },

    /// IO operation failed
    Io(std::io::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),
}

impl ExportError {
    pub fn producer(producer: impl Into<String>, message: impl fmt::Display) -> Self {
        ExportError::Producer {
            producer: producer.into(),
            message: message.to_string(),
        }
    }

    /// Wraps a caught panic payload from `source`.
    pub fn panicked(source: impl Into<String>, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ExportError::Panicked {
            source: source.into(),
            message,
        }
    }

    /// Capacity faults leave the writer mid-record, so the whole cycle must be discarded.
    pub fn is_capacity(&self) -> bool {
        matches!(self, ExportError::BufferExhausted { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExportError::Cancelled | ExportError::TimedOut)
    }
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::BufferExhausted { requested, capacity } => write!(
                f,
                "Scratch buffer exhausted: write reaches byte {} of {}",
                requested, capacity
            ),
            ExportError::Producer { producer, message } => {
                write!(f, "Producer {} failed: {}", producer, message)
            }
            ExportError::Http(err) => write!(f, "HTTP error: {}", err),
            ExportError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ExportError::Cancelled => write!(f, "Export cancelled"),
            ExportError::TimedOut => write!(f, "Export timed out"),
            ExportError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ExportError::SchedulerState(msg) => write!(f, "Scheduler error: {}", msg),
            ExportError::Panicked { source, message } => write!(f, "{} panicked: {}", source, message),
            ExportError::Io(err) => write!(f, "IO error: {}", err),
            ExportError::Json(err) => write!(f, "JSON error: {}", err),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Io(err) => Some(err),
            ExportError::Http(err) => Some(err),
            ExportError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::Io(err)
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(err: reqwest::Error) -> Self {
        ExportError::Http(err)
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Json(err)
    }
}
