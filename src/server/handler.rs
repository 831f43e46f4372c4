//! WebSocket connection handler
//!
//! Drives one connection through its lifecycle: join the room, relay every
//! inbound payload to the other members, and leave the room on every exit
//! path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_LOG_PREVIEW_CHARS;
use crate::room::{ConnectionId, Payload, PeerHandle, RoomId, RoomRegistry};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress, not yet in a room
    Connecting,
    /// Joined and relaying messages
    Active,
    /// Receive loop ended, leaving the room
    Closing,
    /// Left the room; terminal
    Closed,
}

/// Outcome of relaying one payload to a room
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the payload was queued for
    pub delivered: usize,
    /// Peers whose send failed
    pub failed: usize,
}

/// Totals for a finished connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSummary {
    /// Payloads received and relayed
    pub messages: usize,
    /// Individual peer sends that failed
    pub failed_sends: usize,
}

/// Handles a single connection's membership and relay loop
pub struct ConnectionHandler {
    registry: Arc<RoomRegistry>,
    room: RoomId,
    peer: PeerHandle,
    state: ConnectionState,
    preview_chars: usize,
    summary: HandlerSummary,
}

impl ConnectionHandler {
    /// Create a handler for a connection that has been accepted into `room`
    pub fn new(registry: Arc<RoomRegistry>, room: RoomId, peer: PeerHandle) -> Self {
        Self {
            registry,
            room,
            peer,
            state: ConnectionState::Connecting,
            preview_chars: DEFAULT_LOG_PREVIEW_CHARS,
            summary: HandlerSummary::default(),
        }
    }

    /// Set how many characters of each payload are logged
    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.peer.id()
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection until it closes
    ///
    /// The connection is always removed from its room before this returns,
    /// whether the loop ended by disconnect, transport error, shutdown or panic.
    pub async fn run<S>(mut self, inbound: S, shutdown_rx: broadcast::Receiver<()>) -> HandlerSummary
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        self.registry.join(&self.room, self.peer.clone()).await;
        self.transition(ConnectionState::Active);
        info!("WebSocket connected: room={} connection={}", self.room, self.id());

        let outcome = AssertUnwindSafe(self.receive_loop(inbound, shutdown_rx))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!(
                "Receive loop panicked: room={} connection={}",
                self.room,
                self.id()
            );
        }

        self.transition(ConnectionState::Closing);
        self.registry.leave(&self.room, self.peer.id()).await;
        self.transition(ConnectionState::Closed);
        info!(
            "WebSocket disconnected: room={} connection={} relayed={} failed_sends={}",
            self.room,
            self.id(),
            self.summary.messages,
            self.summary.failed_sends
        );

        self.summary
    }

    async fn receive_loop<S>(&mut self, mut inbound: S, mut shutdown_rx: broadcast::Receiver<()>)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                msg = inbound.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.relay(Payload::Text(text)).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.relay(Payload::Binary(data)).await;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            // Control frames are answered by the transport
                        }
                        Some(Ok(Message::Frame(_))) => {
                            // Raw frame, ignore
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!("Connection {} requested close", self.id());
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error on connection {}: {}", self.id(), e);
                            break;
                        }
                        None => {
                            debug!("Connection {} closed by peer", self.id());
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection {}", self.id());
                    break;
                }
            }
        }
    }

    async fn relay(&mut self, payload: Payload) {
        info!(
            "Received in room={}: {}",
            self.room,
            payload.preview(self.preview_chars)
        );

        let report = self.broadcast(payload).await;
        self.summary.messages += 1;
        self.summary.failed_sends += report.failed;
        debug!(
            "Relayed in room={}: delivered={} failed={}",
            self.room, report.delivered, report.failed
        );
    }

    /// Send a payload to every other member of this connection's room
    ///
    /// Iterates a snapshot of the membership so no lock is held while
    /// sending. A failed send is logged and counted; it never stops delivery
    /// to the remaining peers and never removes the failing peer.
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let peers = self.registry.snapshot(&self.room).await;
        let mut report = BroadcastReport::default();

        for peer in peers.iter().filter(|peer| peer.id() != self.peer.id()) {
            match peer.send(payload.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed sending to peer in room={}: {}", self.room, e);
                }
            }
        }

        report
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            "Connection {} state {:?} -> {:?}",
            self.id(),
            self.state,
            next
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::task::Poll;

    use futures_util::stream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use super::*;

    type Inbound = Result<Message, tungstenite::Error>;

    fn text(s: &str) -> Inbound {
        Ok(Message::Text(s.to_string()))
    }

    /// Inbound stream fed from a channel; ends when the sender is dropped
    fn inbound_channel() -> (
        mpsc::UnboundedSender<Inbound>,
        impl Stream<Item = Inbound> + Unpin,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        (tx, stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    fn spawn_handler<S>(
        registry: &Arc<RoomRegistry>,
        room: &str,
        peer: PeerHandle,
        inbound: S,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> JoinHandle<HandlerSummary>
    where
        S: Stream<Item = Inbound> + Unpin + Send + 'static,
    {
        let handler = ConnectionHandler::new(Arc::clone(registry), RoomId::from(room), peer);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(handler.run(inbound, shutdown_rx))
    }

    fn member_ids(peers: &[PeerHandle]) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = peers.iter().map(PeerHandle::id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_handler_starts_connecting() {
        let registry = Arc::new(RoomRegistry::new());
        let (peer, _rx) = PeerHandle::channel(4);
        let id = peer.id();
        let handler = ConnectionHandler::new(registry, RoomId::from("alpha"), peer);

        assert_eq!(handler.state(), ConnectionState::Connecting);
        assert_eq!(handler.id(), id);
        assert_eq!(handler.room(), &RoomId::from("alpha"));
    }

    #[tokio::test]
    async fn test_message_reaches_other_member_only() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("alpha");

        let (a, mut a_rx) = PeerHandle::channel(8);
        let (b, mut b_rx) = PeerHandle::channel(8);
        registry.join(&room, b).await;

        let summary = spawn_handler(
            &registry,
            "alpha",
            a,
            stream::iter(vec![text("hello")]),
            &shutdown_tx,
        )
        .await
        .unwrap();

        assert_eq!(b_rx.recv().await, Some(Payload::Text("hello".into())));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(
            summary,
            HandlerSummary {
                messages: 1,
                failed_sends: 0
            }
        );
    }

    #[tokio::test]
    async fn test_departed_member_is_skipped() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("beta");

        let (a, _a_rx) = PeerHandle::channel(8);
        let (b, mut b_rx) = PeerHandle::channel(8);
        let (c, mut c_rx) = PeerHandle::channel(8);
        let (a_id, c_id) = (a.id(), c.id());
        registry.join(&room, c).await;

        // B joins and immediately disconnects
        spawn_handler(&registry, "beta", b, stream::empty(), &shutdown_tx)
            .await
            .unwrap();

        let (a_tx, a_inbound) = inbound_channel();
        let a_task = spawn_handler(&registry, "beta", a, a_inbound, &shutdown_tx);
        a_tx.send(text("ping")).unwrap();

        assert_eq!(c_rx.recv().await, Some(Payload::Text("ping".into())));
        let mut expected = vec![a_id, c_id];
        expected.sort();
        assert_eq!(member_ids(&registry.snapshot(&room).await), expected);

        drop(a_tx);
        a_task.await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_member_leaving_removes_room() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let (a, _a_rx) = PeerHandle::channel(8);

        spawn_handler(&registry, "gamma", a, stream::empty(), &shutdown_tx)
            .await
            .unwrap();

        let room = RoomId::from("gamma");
        assert!(registry.snapshot(&room).await.is_empty());
        assert!(!registry.room_ids().await.contains(&room));
    }

    #[tokio::test]
    async fn test_failed_peer_does_not_stop_sender() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("delta");

        let (a, _a_rx) = PeerHandle::channel(8);
        let (b, b_rx) = PeerHandle::channel(8);
        let (c, mut c_rx) = PeerHandle::channel(8);
        drop(b_rx);
        registry.join(&room, b).await;
        registry.join(&room, c).await;

        let summary = spawn_handler(
            &registry,
            "delta",
            a,
            stream::iter(vec![text("offer"), text("candidate")]),
            &shutdown_tx,
        )
        .await
        .unwrap();

        assert_eq!(c_rx.recv().await, Some(Payload::Text("offer".into())));
        assert_eq!(c_rx.recv().await, Some(Payload::Text("candidate".into())));
        assert_eq!(
            summary,
            HandlerSummary {
                messages: 2,
                failed_sends: 2
            }
        );
        // The failing peer is left for its own handler to clean up
        assert_eq!(registry.member_count(&room).await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_report() {
        let registry = Arc::new(RoomRegistry::new());
        let room = RoomId::from("delta");

        let (a, _a_rx) = PeerHandle::channel(8);
        let (b, b_rx) = PeerHandle::channel(8);
        let (c, _c_rx) = PeerHandle::channel(8);
        let (d, _d_rx) = PeerHandle::channel(8);
        drop(b_rx);
        for peer in [a.clone(), b, c, d] {
            registry.join(&room, peer).await;
        }

        let handler = ConnectionHandler::new(Arc::clone(&registry), room, a);
        let report = handler.broadcast(Payload::Text("sdp".into())).await;
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 2,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_per_sender_ordering() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("order");

        let (a, _a_rx) = PeerHandle::channel(4);
        let (b, mut b_rx) = PeerHandle::channel(4);
        registry.join(&room, b).await;

        let messages: Vec<String> = (0..32).map(|i| format!("msg-{}", i)).collect();
        let inbound: Vec<Inbound> = messages.iter().map(|m| text(m)).collect();
        let task = spawn_handler(&registry, "order", a, stream::iter(inbound), &shutdown_tx);

        for expected in &messages {
            assert_eq!(b_rx.recv().await, Some(Payload::Text(expected.clone())));
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_binary_payload_relayed_verbatim() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("bin");

        let (a, _a_rx) = PeerHandle::channel(4);
        let (b, mut b_rx) = PeerHandle::channel(4);
        registry.join(&room, b).await;

        let data = vec![0u8, 159, 146, 150, 255];
        let long_text = "x".repeat(DEFAULT_LOG_PREVIEW_CHARS * 3);
        spawn_handler(
            &registry,
            "bin",
            a,
            stream::iter(vec![Ok(Message::Binary(data.clone())), text(&long_text)]),
            &shutdown_tx,
        )
        .await
        .unwrap();

        assert_eq!(b_rx.recv().await, Some(Payload::Binary(data)));
        assert_eq!(b_rx.recv().await, Some(Payload::Text(long_text)));
    }

    #[tokio::test]
    async fn test_control_frames_are_not_relayed() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("ctl");

        let (a, _a_rx) = PeerHandle::channel(4);
        let (b, mut b_rx) = PeerHandle::channel(4);
        registry.join(&room, b).await;

        let summary = spawn_handler(
            &registry,
            "ctl",
            a,
            stream::iter(vec![
                Ok(Message::Ping(vec![1])),
                Ok(Message::Pong(vec![2])),
                text("real"),
            ]),
            &shutdown_tx,
        )
        .await
        .unwrap();

        assert_eq!(summary.messages, 1);
        assert_eq!(b_rx.recv().await, Some(Payload::Text("real".into())));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_and_error_end_the_loop() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("end");

        let (b, mut b_rx) = PeerHandle::channel(8);
        registry.join(&room, b).await;

        let (a, _a_rx) = PeerHandle::channel(8);
        let summary = spawn_handler(
            &registry,
            "end",
            a,
            stream::iter(vec![text("before"), Ok(Message::Close(None)), text("after")]),
            &shutdown_tx,
        )
        .await
        .unwrap();
        assert_eq!(summary.messages, 1);

        let (c, _c_rx) = PeerHandle::channel(8);
        let summary = spawn_handler(
            &registry,
            "end",
            c,
            stream::iter(vec![
                Err(tungstenite::Error::ConnectionClosed),
                text("after"),
            ]),
            &shutdown_tx,
        )
        .await
        .unwrap();
        assert_eq!(summary.messages, 0);

        assert_eq!(b_rx.recv().await, Some(Payload::Text("before".into())));
        assert!(b_rx.try_recv().is_err());
        assert_eq!(registry.member_count(&room).await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_room() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let room = RoomId::from("shutdown");

        let (a, _a_rx) = PeerHandle::channel(4);
        let (a_tx, a_inbound) = inbound_channel();
        let task = spawn_handler(&registry, "shutdown", a, a_inbound, &shutdown_tx);

        while registry.member_count(&room).await == 0 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(registry.room_count().await, 0);
        drop(a_tx);
    }

    #[tokio::test]
    async fn test_panic_in_receive_loop_still_leaves_room() {
        let registry = Arc::new(RoomRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let (a, _a_rx) = PeerHandle::channel(4);
        let exploding = stream::poll_fn(|_| -> Poll<Option<Inbound>> { panic!("transport bug") });
        let summary = spawn_handler(&registry, "panic", a, exploding, &shutdown_tx)
            .await
            .unwrap();

        assert_eq!(summary, HandlerSummary::default());
        assert_eq!(registry.room_count().await, 0);
    }
}
