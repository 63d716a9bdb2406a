//! Core types, config, errors, and the client wire protocol for Lingua Relay.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
