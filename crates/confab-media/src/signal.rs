//! Close notifications
//!
//! Every engine handle carries a [`CloseNotifier`]; anyone interested in the
//! handle's end of life holds a [`CloseSignal`] and awaits it.

use std::fmt;
use tokio::sync::watch;

/// Why a handle was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// `close()` was called on the handle itself
    Closed,
    /// The owning transport closed (`transportclose`)
    TransportClosed,
    /// The source producer closed (`producerclose`)
    ProducerClosed,
    /// The owning router closed
    RouterClosed,
    /// The owning worker was closed on purpose
    WorkerClosed,
    /// The worker terminated unexpectedly
    WorkerDied,
    /// The DTLS session of the transport ended
    DtlsClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Closed => "closed",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::ProducerClosed => "producer_closed",
            CloseReason::RouterClosed => "router_closed",
            CloseReason::WorkerClosed => "worker_closed",
            CloseReason::WorkerDied => "worker_died",
            CloseReason::DtlsClosed => "dtls_closed",
        };
        f.write_str(name)
    }
}

/// Sending half, owned by the handle
#[derive(Debug)]
pub struct CloseNotifier {
    tx: watch::Sender<Option<CloseReason>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Mark closed. Returns `false` if it was already closed; the first reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CloseReason> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half; resolves once the handle closes
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    /// Wait for the close. Resolves immediately if the handle is already closed.
    pub async fn wait(mut self) -> CloseReason {
        match self.rx.wait_for(Option::is_some).await {
            Ok(state) => {
                let reason = *state;
                reason.unwrap_or(CloseReason::Closed)
            }
            // Handle dropped without an explicit close
            Err(_) => CloseReason::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.borrow().is_some()
    }
}
