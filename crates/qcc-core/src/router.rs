//! Request Router: fans logical commands out to every Peer Session,
//! correlates replies by a content-derived key, and resolves or rejects
//! the caller based on the Quorum Comparator.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::peer::PeerHandle;
use crate::wire::{Inbound, CMD_TRANSFER};

/// Threshold generalized as `floor(N/2) + 1`; for N=3 this is the
/// explicit constant 2.
fn majority(peer_count: usize) -> usize {
    peer_count / 2 + 1
}

#[derive(Clone)]
enum RouterOutcome {
    Resolved(Arc<Inbound>),
    Rejected { command: u32, responses: usize },
}

type SharedReply = Shared<BoxFuture<'static, RouterOutcome>>;

struct PendingEntry {
    command: u32,
    raw: Vec<Option<Vec<u8>>>,
    parsed: Vec<Option<Inbound>>,
    responder: Option<tokio::sync::oneshot::Sender<RouterOutcome>>,
    shared: SharedReply,
}

pub struct RequestRouter {
    peers: Vec<PeerHandle>,
    peer_count: usize,
    pending: Mutex<HashMap<String, PendingEntry>>,
    first_open: Mutex<Vec<bool>>,
    first_open_notify: tokio::sync::Notify,
}

impl RequestRouter {
    /// Subscribes to `events` and builds the router. If any peer session
    /// that can reach `Open` is spawned before this call, prefer
    /// [`RequestRouter::with_subscription`] with a subscription taken
    /// before spawning those peers instead — see its docs.
    pub fn new(peers: Vec<PeerHandle>, events: EventBus) -> Arc<Self> {
        let sub = events.subscribe();
        Self::with_subscription(peers, sub)
    }

    /// Builds the router from an already-established event subscription.
    /// Callers that need the subscription to exist before peer sessions
    /// start connecting (so a fast peer's `Open` can't be emitted into a
    /// bus with no listener yet) should call `events.subscribe()`
    /// themselves, ahead of spawning any peer, and pass the receiver here
    /// instead of going through `new`.
    pub fn with_subscription(
        peers: Vec<PeerHandle>,
        mut sub: tokio::sync::broadcast::Receiver<CoreEvent>,
    ) -> Arc<Self> {
        let peer_count = peers.len();
        let router = Arc::new(Self {
            peers,
            peer_count,
            pending: Mutex::new(HashMap::new()),
            first_open: Mutex::new(vec![false; peer_count]),
            first_open_notify: tokio::sync::Notify::new(),
        });
        let task_router = router.clone();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(CoreEvent::Open { peer_index }) => {
                        let mut flags = task_router.first_open.lock();
                        if let Some(f) = flags.get_mut(peer_index) {
                            *f = true;
                        }
                        if flags.iter().all(|f| *f) {
                            task_router.first_open_notify.notify_waiters();
                        }
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
        router
    }

    fn key(command: u32, correlation: &str) -> String {
        format!("{command}:{correlation}")
    }

    async fn await_all_first_open(&self) {
        loop {
            if self.first_open.lock().iter().all(|f| *f) {
                return;
            }
            self.first_open_notify.notified().await;
        }
    }

    /// `payload` must already contain every request field except
    /// `command`; `correlation` is the identity/hash/digest field value
    /// used to build the coalescing key.
    pub async fn send_command(
        self: &Arc<Self>,
        command: u32,
        mut payload: serde_json::Value,
        correlation: String,
    ) -> Result<Inbound> {
        self.await_all_first_open().await;

        let key = Self::key(command, &correlation);

        let shared = {
            let mut pending = self.pending.lock();
            if let Some(entry) = pending.get(&key) {
                entry.shared.clone()
            } else {
                let (tx, rx) = tokio::sync::oneshot::channel::<RouterOutcome>();
                let shared: SharedReply = async move {
                    rx.await
                        .unwrap_or(RouterOutcome::Rejected { command, responses: 0 })
                }
                .boxed()
                .shared();
                pending.insert(
                    key.clone(),
                    PendingEntry {
                        command,
                        raw: vec![None; self.peer_count],
                        parsed: vec![None; self.peer_count],
                        responder: Some(tx),
                        shared: shared.clone(),
                    },
                );

                if let serde_json::Value::Object(ref mut map) = payload {
                    map.insert("command".to_string(), serde_json::json!(command));
                } else {
                    unreachable!("payload must be a JSON object");
                }
                let text = payload.to_string();
                trace!(%key, "broadcasting new request");
                for peer in &self.peers {
                    peer.send_tracked(key.clone(), text.clone());
                }
                shared
            }
        };

        match shared.await {
            RouterOutcome::Resolved(msg) => Ok((*msg).clone()),
            RouterOutcome::Rejected { command, responses } => {
                Err(Error::InvalidResponses { command, responses })
            }
        }
    }

    /// Command 3: fire-and-forget transfer submission. Broadcasts to all
    /// peers and returns immediately, registering no pending request.
    pub fn send_fire_and_forget(&self, mut payload: serde_json::Value) {
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("command".to_string(), serde_json::json!(CMD_TRANSFER));
        }
        let text = payload.to_string();
        for peer in &self.peers {
            peer.send_once(text.clone());
        }
    }

    /// Called by the connection core for every inbound non-info message.
    pub fn handle_inbound(&self, peer_index: usize, msg: Inbound) {
        let Some(correlation) = msg.correlation() else {
            return;
        };
        let key = Self::key(msg.command(), &correlation);

        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&key) else {
            return;
        };
        if peer_index >= entry.raw.len() {
            return;
        }

        let raw = match msg.canonical_bytes() {
            Ok(b) => b,
            Err(_) => return,
        };
        entry.raw[peer_index] = Some(raw);
        entry.parsed[peer_index] = Some(msg);

        let threshold = majority(self.peer_count);
        let q = crate::quorum::quorum_size(&entry.raw);

        if q >= threshold {
            let idx = crate::quorum::quorum_index(&entry.raw).expect("quorum implies an index");
            let winner = entry.parsed[idx].clone().expect("raw implies parsed");
            debug!(%key, quorum = q, "resolved by quorum");
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(RouterOutcome::Resolved(Arc::new(winner)));
            }
            let command = entry.command;
            pending.remove(&key);
            drop(pending);
            for peer in &self.peers {
                peer.untrack(key.clone());
            }
            let _ = command;
            return;
        }

        if entry.raw.iter().all(Option::is_some) {
            debug!(%key, "all peers replied, no quorum");
            let command = entry.command;
            let responses = entry.raw.len();
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(RouterOutcome::Rejected { command, responses });
            }
            pending.remove(&key);
            drop(pending);
            for peer in &self.peers {
                peer.untrack(key.clone());
            }
        }
    }
}
