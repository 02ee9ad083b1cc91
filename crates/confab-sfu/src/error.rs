use confab_media::EngineError;
use confab_protocol::ErrorCode;
use std::fmt;
use thiserror::Error;

/// Kind of entity a lookup failed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Transport,
    Producer,
    Consumer,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Transport => "transport",
            EntityKind::Producer => "producer",
            EntityKind::Consumer => "consumer",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("Participant has not joined a room")]
    NotJoined,

    #[error("Receiver cannot consume producer {0}")]
    Incompatible(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Engine call {op} failed: {source}")]
    Engine {
        op: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Engine call {op} timed out")]
    EngineTimeout { op: &'static str },

    #[error("No media worker available")]
    WorkerUnavailable,
}

impl SfuError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        SfuError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Caller errors are answered but never reported as system faults
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SfuError::NotFound { .. }
                | SfuError::NotJoined
                | SfuError::Incompatible(_)
                | SfuError::InvalidState(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SfuError::NotFound { .. } => ErrorCode::NotFound,
            SfuError::NotJoined | SfuError::InvalidState(_) => ErrorCode::InvalidState,
            SfuError::Incompatible(_) => ErrorCode::Incompatible,
            SfuError::Engine { .. } => ErrorCode::EngineFailure,
            SfuError::EngineTimeout { .. } | SfuError::WorkerUnavailable => ErrorCode::Unavailable,
        }
    }

    /// Message relayed to the client
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Engine { op, .. } => format!("Media engine failed during {op}"),
            _ => self.to_string(),
        }
    }

    /// Log at the level matching the error class
    pub fn log(&self, event: &str) {
        if self.is_caller_error() {
            tracing::debug!(event, error = %self, "Request rejected");
        } else {
            tracing::error!(event, error = ?self, "Request failed");
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
