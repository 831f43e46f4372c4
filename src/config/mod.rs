//! Configuration module
//!
//! Handles loading the relay server configuration.

mod server;

pub use server::*;
