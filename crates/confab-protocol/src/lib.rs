//! Shared protocol definitions for Confab calls
//!
//! Identifiers, media negotiation parameters, and the signaling messages
//! exchanged between call clients and the SFU.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
