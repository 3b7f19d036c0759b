//! Adapter between a hosted XMPP group-chat service and a bot automation bus.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod directory;
pub mod error;
pub mod xmpp;
