//! WebSocket server module
//!
//! Accepts connections, answers the health endpoint, and runs one
//! connection handler per room member.

#[allow(dead_code)]
mod handler;
mod http;
#[allow(dead_code)]
mod route;
mod websocket;

#[allow(unused_imports)]
pub use handler::*;
#[allow(unused_imports)]
pub use route::*;
pub use websocket::*;
