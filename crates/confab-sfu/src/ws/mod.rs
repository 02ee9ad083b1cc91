//! WebSocket signaling adapter

pub mod connections;
pub mod handler;

pub use connections::ConnectionManager;
pub use handler::ws_handler;
