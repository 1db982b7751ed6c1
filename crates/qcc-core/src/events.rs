//! Multi-listener publish/subscribe event bus: a `tokio::sync::broadcast`
//! channel per bus, fanning out to every subscriber. A slow or absent
//! subscriber never blocks emission, and one subscriber's processing
//! failure can't affect another's — each gets its own receiver and
//! processes independently.

use crate::wire::MessageDigest;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Sync level transition. `epoch`/`tick` are absent for watchdog-driven
    /// demotions to 0.
    Info {
        sync_status: usize,
        epoch: Option<u32>,
        tick: Option<u16>,
    },
    /// Peer slot `index` reached `Open`.
    Open { peer_index: usize },
    /// Peer slot `index` left `Open` (any non-terminate close).
    Close { peer_index: usize },
    /// A transport-level problem on peer slot `index`; never fatal.
    Error { peer_index: usize, message: String },
    Inclusion {
        digest: MessageDigest,
        inclusion_state: bool,
        tick: u16,
        epoch: u32,
    },
    Rejection {
        digest: MessageDigest,
        reason: String,
    },
    EnvironmentData {
        environment_digest: MessageDigest,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Emits to every current subscriber. Returns the number reached; an
    /// event with no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
