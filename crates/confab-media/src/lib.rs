//! Media engine boundary for Confab
//!
//! This crate provides:
//! - The handle traits the SFU drives (worker, router, transport, producer, consumer)
//! - Close signalling shared by every handle
//! - The router codec list
//! - An in-process loopback engine

pub mod codec;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod signal;

pub use engine::*;
pub use error::EngineError;
pub use loopback::{EngineGate, EngineOp, LoopbackEngine};
pub use signal::{CloseNotifier, CloseReason, CloseSignal};
