//! WebSocket server implementation
//!
//! Listens for connections, routes each request by path, upgrades
//! `/ws/{room_id}` requests to WebSocket and hands them to a
//! [`ConnectionHandler`]. Health and preflight requests are answered directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::handler::ConnectionHandler;
use super::http::{
    encode, health_response, preflight_response, status_response, HttpError, RequestHead,
};
use super::route::{HealthStatus, Route};
use crate::config::ServerConfig;
use crate::room::{ConnectionId, Payload, PeerHandle, RoomId, RoomRegistry};

/// Errors that end a single connection before it joins a room
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("Handshake completed without a room")]
    MissingRoom,

    #[error("Malformed request: {0}")]
    BadRequest(#[from] httparse::Error),

    #[error("Request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,

    #[error("Request head not received within {HEAD_TIMEOUT:?}")]
    HeadTimeout,

    #[error("Failed to build response: {0}")]
    Http(#[from] HttpError),
}

/// Largest request head inspected before routing
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Time a client has to send its complete request head
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between peeks while a request head is still arriving
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

/// Result type for connection handling
pub type ServerResult<T> = Result<T, ServerError>;

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(data) => Message::Binary(data),
        }
    }
}

/// Relay server accepting room connections
pub struct WebSocketServer {
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new server with an empty room registry
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(RoomRegistry::new()))
    }

    /// Create a server around an existing registry
    pub fn with_registry(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            registry,
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    /// Trigger server shutdown
    ///
    /// Stops accepting connections and ends every active receive loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Relay listening on ws://{}/ws/{{room_id}}", addr);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let config = Arc::clone(&self.config);
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, config, registry, shutdown_rx).await {
                                    debug!("Connection from {} ended early: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let rooms = self.registry.room_count().await;
        if rooms > 0 {
            info!("Closing connections in {} active rooms", rooms);
        }

        Ok(())
    }
}

/// Route one TCP connection and, for room requests, run it to completion
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServerResult<()> {
    debug!("New connection from {}", peer_addr);

    let head = tokio::select! {
        result = timeout(HEAD_TIMEOUT, peek_head(&stream)) => {
            result.map_err(|_| ServerError::HeadTimeout)?
        }
        _ = shutdown_rx.recv() => {
            debug!("Shutdown before {} sent a request", peer_addr);
            return Ok(());
        }
    };

    let head = match head {
        Ok(Some(head)) => head,
        Ok(None) => {
            debug!("Connection from {} closed before sending a request", peer_addr);
            return Ok(());
        }
        Err(e @ (ServerError::BadRequest(_) | ServerError::HeadTooLarge)) => {
            let reply = status_response(StatusCode::BAD_REQUEST, None)?;
            let _ = stream.write_all(&encode(&reply)).await;
            let _ = stream.shutdown().await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let cors_origin = config.cors_origin(head.origin.as_deref());
    let reply = match (head.method.as_str(), head.route()) {
        ("OPTIONS", _) => Some(preflight_response(
            cors_origin,
            head.requested_headers.as_deref(),
        )),
        ("GET", Route::Health) => {
            let status = HealthStatus::ok(registry.room_count().await);
            Some(health_response(&status, cors_origin))
        }
        ("GET", Route::Room(_)) => None,
        (_, Route::NotFound) => Some(status_response(StatusCode::NOT_FOUND, cors_origin)),
        (_, Route::Health | Route::Room(_)) => {
            Some(status_response(StatusCode::METHOD_NOT_ALLOWED, cors_origin))
        }
    };

    if let Some(reply) = reply {
        let reply = reply?;
        debug!(
            "{} {} from {}: {}",
            head.method,
            head.target,
            peer_addr,
            reply.status()
        );
        // Consume the peeked head so closing the socket sends FIN, not RST
        let mut consumed = vec![0; head.len];
        stream.read_exact(&mut consumed).await?;
        stream.write_all(&encode(&reply)).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let mut ws_config = WebSocketConfig::default();
    if config.max_message_bytes.is_some() {
        ws_config.max_message_size = config.max_message_bytes;
    }

    // The head was only peeked; the handshake reads it again from the socket.
    let mut room = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        room = Some(check_handshake(&config, request)?);
        Ok(response)
    };
    let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let room = room.ok_or(ServerError::MissingRoom)?;

    let (peer, outbound_rx) = PeerHandle::channel(config.peer_queue_capacity);
    let (ws_sender, ws_receiver) = ws_stream.split();
    tokio::spawn(write_outbound(ws_sender, outbound_rx, peer.id()));

    info!("Connection from {} accepted into room={}", peer_addr, room);
    ConnectionHandler::new(registry, room, peer)
        .with_preview_chars(config.log_preview_chars)
        .run(ws_receiver, shutdown_rx)
        .await;

    Ok(())
}

/// Peek at the socket until a complete request head has arrived
///
/// Nothing is consumed. Returns `None` if the client closes first.
async fn peek_head(stream: &TcpStream) -> ServerResult<Option<RequestHead>> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let mut seen = 0;

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(head) = RequestHead::parse(&buf[..n])? {
            return Ok(Some(head));
        }
        if n == buf.len() {
            return Err(ServerError::HeadTooLarge);
        }
        // peek returns at once while unread bytes are queued; wait for more
        if n == seen {
            sleep(PEEK_INTERVAL).await;
        }
        seen = n;
    }
}

/// Validate the upgrade request and extract its room
fn check_handshake(config: &ServerConfig, request: &Request) -> Result<RoomId, ErrorResponse> {
    let room = match Route::parse(&request.uri().to_string()) {
        Route::Room(room) => room,
        _ => return Err(reject(StatusCode::NOT_FOUND, "Not Found")),
    };

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !config.origin_allowed(origin) {
        warn!("Rejected handshake for room={} from origin {:?}", room, origin);
        return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
    }

    Ok(room)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Single writer for one socket: drains the connection's outbound queue
///
/// Exits when the queue closes (the connection left and no broadcast still
/// holds its handle) or the socket fails. Dropping the queue receiver makes
/// further sends to this peer fail.
async fn write_outbound<S>(mut sink: S, mut outbound_rx: mpsc::Receiver<Payload>, id: ConnectionId)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(payload) = outbound_rx.recv().await {
        if let Err(e) = sink.send(payload.into()).await {
            debug!("Writer for connection {} stopped: {}", id, e);
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    debug!("Writer for connection {} finished", id);
}
