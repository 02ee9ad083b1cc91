use confab_protocol::{MediaKind, ProducerId};
use thiserror::Error;

/// Failure reported by the media engine for a single call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Worker could not be created: {0}")]
    WorkerCreation(String),

    #[error("Worker is closed")]
    WorkerClosed,

    #[error("Router is closed")]
    RouterClosed,

    #[error("Transport is closed")]
    TransportClosed,

    #[error("Consumer is closed")]
    ConsumerClosed,

    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Producer {0} not found on this router")]
    UnknownProducer(ProducerId),

    #[error("Kind {kind} does not match codec {mime_type}")]
    KindMismatch { kind: MediaKind, mime_type: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}
