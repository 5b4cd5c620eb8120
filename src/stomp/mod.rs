//! STOMP 1.2 over WebSocket
//!
//! The chat broker speaks STOMP on a plain WebSocket endpoint. This module
//! only knows about frames and sockets; channel semantics live in
//! `crate::messaging`.

pub mod frame;
pub mod websocket;

#[cfg(test)]
pub mod test_broker;

pub use frame::{Command, Frame, HeartBeat, Incoming};
pub use websocket::StompSocket;
