//! Server configuration
//!
//! Loaded from an optional TOML file; command line arguments override it.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::room::DEFAULT_QUEUE_CAPACITY;

/// Default port, matching the relay's usual deployment
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Maximum characters of a payload shown in log lines
pub const DEFAULT_LOG_PREVIEW_CHARS: usize = 200;

/// Origin wildcard accepting any browser origin
pub const ANY_ORIGIN: &str = "*";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the relay server
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Origins accepted for the WebSocket handshake (`*` for any)
    pub allowed_origins: Vec<String>,
    /// Outbound queue capacity per connection
    pub peer_queue_capacity: usize,
    /// Largest inbound message accepted by the transport, if capped
    pub max_message_bytes: Option<usize>,
    /// Characters of each payload included in log lines
    pub log_preview_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            allowed_origins: vec![ANY_ORIGIN.to_string()],
            peer_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_message_bytes: None,
            log_preview_chars: DEFAULT_LOG_PREVIEW_CHARS,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replace the accepted origins
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Whether a handshake from `origin` is accepted
    ///
    /// Requests without an `Origin` header are not browser requests and are
    /// always accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == ANY_ORIGIN || allowed.eq_ignore_ascii_case(origin)),
        }
    }

    /// Value for the `access-control-allow-origin` response header
    pub fn cors_origin<'a>(&'a self, origin: Option<&'a str>) -> Option<&'a str> {
        if self.allowed_origins.iter().any(|allowed| allowed == ANY_ORIGIN) {
            return Some(ANY_ORIGIN);
        }
        origin.filter(|origin| self.origin_allowed(Some(origin)))
    }
}
