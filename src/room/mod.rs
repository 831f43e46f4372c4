//! Room membership module
//!
//! Tracks which connections belong to which room and provides the handles
//! used to deliver relayed payloads to them.

#[allow(dead_code)]
mod peer;
#[allow(dead_code)]
mod registry;

pub use peer::*;
pub use registry::*;
