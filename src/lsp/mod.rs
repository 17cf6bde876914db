//! Language-server side: configuration, per-server clients, and the
//! registry that owns them.

pub mod client;
pub mod config;
pub mod registry;
