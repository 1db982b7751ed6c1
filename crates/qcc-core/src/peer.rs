//! Peer Session: one persistent, auto-reconnecting, message-framed
//! connection to a single computor.
//!
//! State machine: `Connecting -> Open -> (Closing | Failed) ->
//! ReconnectPending -> Connecting -> ...`. Each session runs as its own
//! Tokio task, forwarding parsed inbound frames to the owning core over an
//! mpsc channel and taking commands (send/terminate/set endpoint) over
//! another. All outstanding-request bookkeeping needed for replay lives
//! inside the task, so the task is the sole owner of this peer's slice of
//! connection state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};
use url::Url;

use crate::events::{CoreEvent, EventBus};

/// Lifecycle state of a [`PeerSession`]'s socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Open,
    Closing,
    Failed,
    ReconnectPending,
}

/// A connected, bidirectional text-frame socket. Implemented over
/// `tokio-tungstenite` by default; substitutable in tests.
#[async_trait]
pub trait PeerSocket: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
    /// `Ok(None)` signals a clean close.
    async fn recv_text(&mut self) -> anyhow::Result<Option<String>>;
}

/// Establishes connections to a peer endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> anyhow::Result<Box<dyn PeerSocket>>;
}

/// Default connector: plain WebSocket over TCP/TLS via `tokio-tungstenite`.
#[derive(Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> anyhow::Result<Box<dyn PeerSocket>> {
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(Box::new(TungsteniteSocket { stream }))
    }
}

struct TungsteniteSocket {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl PeerSocket for TungsteniteSocket {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(t))) => return Ok(Some(t.to_string())),
                Some(Ok(WsMessage::Binary(b))) => {
                    return Ok(Some(String::from_utf8(b.to_vec())?));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

enum PeerCommand {
    /// Send and remember `text` under `key` so it is replayed on every
    /// future `Open` transition until explicitly untracked.
    SendTracked { key: String, text: String },
    /// Send without tracking for replay (fire-and-forget, command 3).
    SendOnce { text: String },
    Untrack { key: String },
    SetEndpoint(Url),
    /// Close the current socket and go through the normal
    /// reconnect-pending path, without detaching the close callback the
    /// way `Terminate` does. Used when an inbound frame fails to parse: a
    /// malformed frame implies protocol corruption, and the reconnect
    /// path is simpler than partial-state recovery.
    ForceReconnect,
    Terminate,
}

/// Cheap, cloneable handle to a running peer session task.
#[derive(Clone)]
pub struct PeerHandle {
    index: usize,
    endpoint: Arc<parking_lot::RwLock<Url>>,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> Url {
        self.endpoint.read().clone()
    }

    /// Terminate-and-reopen iff the endpoint actually changes.
    pub fn set_endpoint(&self, url: Url) {
        if *self.endpoint.read() != url {
            let _ = self.commands.send(PeerCommand::SetEndpoint(url));
        }
    }

    pub fn send_tracked(&self, key: impl Into<String>, text: impl Into<String>) {
        let _ = self.commands.send(PeerCommand::SendTracked {
            key: key.into(),
            text: text.into(),
        });
    }

    pub fn send_once(&self, text: impl Into<String>) {
        let _ = self.commands.send(PeerCommand::SendOnce { text: text.into() });
    }

    pub fn untrack(&self, key: impl Into<String>) {
        let _ = self.commands.send(PeerCommand::Untrack { key: key.into() });
    }

    pub fn terminate(&self) {
        let _ = self.commands.send(PeerCommand::Terminate);
    }

    pub fn force_reconnect(&self) {
        let _ = self.commands.send(PeerCommand::ForceReconnect);
    }
}

/// Spawns the peer session task and returns a handle to control it.
/// `inbound` receives `(peer_index, raw_frame)` for every text frame the
/// socket delivers while Open; the caller (the connection core) is
/// responsible for parsing and routing it.
pub fn spawn(
    index: usize,
    endpoint: Url,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    events: EventBus,
    inbound: mpsc::UnboundedSender<(usize, String)>,
) -> PeerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let endpoint_cell = Arc::new(parking_lot::RwLock::new(endpoint.clone()));
    let handle = PeerHandle {
        index,
        endpoint: endpoint_cell.clone(),
        commands: tx,
    };
    tokio::spawn(run(
        index,
        endpoint_cell,
        connector,
        reconnect_delay,
        events,
        inbound,
        rx,
    ));
    handle
}

async fn run(
    index: usize,
    endpoint: Arc<parking_lot::RwLock<Url>>,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    events: EventBus,
    inbound: mpsc::UnboundedSender<(usize, String)>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    // Requests currently believed outstanding at this peer, in the order
    // they were first sent; replayed verbatim on every Open transition.
    let mut outstanding: IndexMap<String, String> = IndexMap::new();
    let mut state = PeerState::Connecting;
    let mut terminated = false;

    'outer: while !terminated {
        let url = endpoint.read().clone();
        trace!(peer = index, %url, "connecting");
        let mut socket = match connector.connect(&url).await {
            Ok(s) => s,
            Err(e) => {
                state = PeerState::Failed;
                events.emit(CoreEvent::Error {
                    peer_index: index,
                    message: e.to_string(),
                });
                if !wait_for_reconnect_or_terminate(
                    &mut commands,
                    &mut outstanding,
                    &endpoint,
                    reconnect_delay,
                )
                .await
                {
                    break 'outer;
                }
                continue 'outer;
            }
        };

        state = PeerState::Open;
        events.emit(CoreEvent::Open { peer_index: index });
        for (_, text) in outstanding.iter() {
            if socket.send_text(text.clone()).await.is_err() {
                break;
            }
        }

        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => {
                    match cmd {
                        None | Some(PeerCommand::Terminate) => {
                            state = PeerState::Closing;
                            terminated = true;
                            break 'outer;
                        }
                        Some(PeerCommand::SendTracked { key, text }) => {
                            outstanding.insert(key, text.clone());
                            let _ = socket.send_text(text).await;
                        }
                        Some(PeerCommand::SendOnce { text }) => {
                            let _ = socket.send_text(text).await;
                        }
                        Some(PeerCommand::Untrack { key }) => {
                            outstanding.shift_remove(&key);
                        }
                        Some(PeerCommand::SetEndpoint(new_url)) => {
                            if *endpoint.read() != new_url {
                                *endpoint.write() = new_url;
                                break;
                            }
                        }
                        Some(PeerCommand::ForceReconnect) => {
                            debug!(peer = index, "forcing reconnect after frame corruption");
                            break;
                        }
                    }
                }
                frame = socket.recv_text() => {
                    match frame {
                        Ok(Some(text)) => {
                            if inbound.send((index, text)).is_err() {
                                terminated = true;
                                break 'outer;
                            }
                        }
                        Ok(None) => {
                            debug!(peer = index, "socket closed by peer");
                            break;
                        }
                        Err(e) => {
                            warn!(peer = index, error = %e, "frame parse/transport error, closing");
                            break;
                        }
                    }
                }
            }
        }

        if terminated {
            break 'outer;
        }

        state = PeerState::ReconnectPending;
        events.emit(CoreEvent::Close { peer_index: index });
        if !wait_for_reconnect_or_terminate(
            &mut commands,
            &mut outstanding,
            &endpoint,
            reconnect_delay,
        )
        .await
        {
            break 'outer;
        }
    }

    let _ = state;
}

/// Sleeps for `delay` while still honoring incoming commands. Unlike the
/// Open-state command loop, no socket is present to send on, so
/// `SendTracked`/`Untrack`/`SetEndpoint` only update bookkeeping (replayed
/// or applied on the next connection attempt); `SendOnce` frames sent while
/// disconnected have no outstanding-request slot to buffer into and are
/// dropped, matching fire-and-forget semantics. Returns `false` if
/// terminated during the wait.
async fn wait_for_reconnect_or_terminate(
    commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
    outstanding: &mut IndexMap<String, String>,
    endpoint: &Arc<parking_lot::RwLock<Url>>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => {
                match cmd {
                    None | Some(PeerCommand::Terminate) => return false,
                    Some(PeerCommand::SendTracked { key, text }) => {
                        outstanding.insert(key, text);
                    }
                    Some(PeerCommand::Untrack { key }) => {
                        outstanding.shift_remove(&key);
                    }
                    Some(PeerCommand::SetEndpoint(new_url)) => {
                        if *endpoint.read() != new_url {
                            *endpoint.write() = new_url;
                        }
                    }
                    Some(PeerCommand::SendOnce { .. }) | Some(PeerCommand::ForceReconnect) => continue,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeSocket {
        outbox: Arc<AsyncMutex<Vec<String>>>,
        inbox: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl PeerSocket for FakeSocket {
        async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
            self.outbox.lock().await.push(text);
            Ok(())
        }
        async fn recv_text(&mut self) -> anyhow::Result<Option<String>> {
            Ok(self.inbox.recv().await)
        }
    }

    struct FakeConnector {
        outbox: Arc<AsyncMutex<Vec<String>>>,
        inbox_rx: Arc<parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _url: &Url) -> anyhow::Result<Box<dyn PeerSocket>> {
            let rx = self.inbox_rx.lock().take().unwrap_or_else(|| {
                let (_tx, rx) = mpsc::unbounded_channel();
                rx
            });
            Ok(Box::new(FakeSocket {
                outbox: self.outbox.clone(),
                inbox: rx,
            }))
        }
    }

    #[tokio::test]
    async fn replays_outstanding_requests_on_open() {
        let outbox = Arc::new(AsyncMutex::new(Vec::new()));
        let (_inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            outbox: outbox.clone(),
            inbox_rx: Arc::new(parking_lot::Mutex::new(Some(inbox_rx))),
        });
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();
        let handle = spawn(
            0,
            Url::parse("wss://example/").unwrap(),
            connector,
            Duration::from_millis(10),
            events,
            inbound_tx,
        );
        handle.send_tracked("k1", "req-1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(outbox.lock().await.as_slice(), ["req-1"]);
        handle.terminate();
    }

    /// A socket whose `recv_text` resolves to a clean close shortly after
    /// connecting, so the peer task is forced through the
    /// `Open -> ReconnectPending -> Connecting -> Open` cycle on its own.
    struct FlakySocket {
        outbox: Arc<AsyncMutex<Vec<String>>>,
        closes_at: tokio::time::Instant,
    }

    #[async_trait]
    impl PeerSocket for FlakySocket {
        async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
            self.outbox.lock().await.push(text);
            Ok(())
        }
        async fn recv_text(&mut self) -> anyhow::Result<Option<String>> {
            tokio::time::sleep_until(self.closes_at).await;
            Ok(None)
        }
    }

    struct FlakyConnector {
        outbox: Arc<AsyncMutex<Vec<String>>>,
        connects: Arc<std::sync::atomic::AtomicUsize>,
        socket_lifetime: Duration,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _url: &Url) -> anyhow::Result<Box<dyn PeerSocket>> {
            self.connects
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(FlakySocket {
                outbox: self.outbox.clone(),
                closes_at: tokio::time::Instant::now() + self.socket_lifetime,
            }))
        }
    }

    #[tokio::test]
    async fn replays_outstanding_request_exactly_once_per_open_after_reconnect() {
        let outbox = Arc::new(AsyncMutex::new(Vec::new()));
        let connects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let connector = Arc::new(FlakyConnector {
            outbox: outbox.clone(),
            connects: connects.clone(),
            socket_lifetime: Duration::from_millis(30),
        });
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();
        let handle = spawn(
            0,
            Url::parse("wss://example/").unwrap(),
            connector,
            Duration::from_millis(10),
            events,
            inbound_tx,
        );
        handle.send_tracked("k1", "req-1");

        // First open: direct send. First close ~30ms in, reconnect ~10ms
        // later, second open replays the still-outstanding request. Stop
        // before the second socket's own close (~70ms) so only two opens
        // have happened.
        tokio::time::sleep(Duration::from_millis(55)).await;
        handle.terminate();

        assert!(connects.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert_eq!(outbox.lock().await.as_slice(), ["req-1", "req-1"]);
    }

    struct AlwaysFailConnector {
        urls: Arc<AsyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connector for AlwaysFailConnector {
        async fn connect(&self, url: &Url) -> anyhow::Result<Box<dyn PeerSocket>> {
            self.urls.lock().await.push(url.to_string());
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn set_endpoint_while_reconnect_pending_is_not_dropped() {
        let urls = Arc::new(AsyncMutex::new(Vec::new()));
        let connector = Arc::new(AlwaysFailConnector { urls: urls.clone() });
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();
        let handle = spawn(
            0,
            Url::parse("wss://old-endpoint/").unwrap(),
            connector,
            Duration::from_millis(40),
            events,
            inbound_tx,
        );

        // Let the first (failing) connect attempt happen, putting the
        // session into its reconnect-pending wait.
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.set_endpoint(Url::parse("wss://new-endpoint/").unwrap());

        // Wait past the reconnect delay so a second connect attempt fires;
        // it must use the new endpoint, not the stale one.
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.terminate();

        assert_eq!(handle.endpoint().as_str(), "wss://new-endpoint/");
        let seen = urls.lock().await;
        assert!(
            seen.iter().any(|u| u == "wss://new-endpoint/"),
            "expected a reconnect attempt against the new endpoint, saw {seen:?}"
        );
    }
}
