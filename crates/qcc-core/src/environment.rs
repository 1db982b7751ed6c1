//! Environment Subscription: a reference-counted client-side subscription
//! to a server-side streaming topic identified by a 32-byte digest. The
//! core sends command 5 to every peer on the first listener for a digest
//! and command 6 once the last listener drops; in between, inbound `data`
//! frames (also command 5, pushed by the peer rather than requested) are
//! fanned out to every listener through a per-digest broadcast channel,
//! the same fan-out shape as the Event Bus, and also re-emitted on the
//! Event Bus itself as [`CoreEvent::EnvironmentData`] for callers (e.g.
//! `qcc watch`) that only want to observe the bus rather than subscribe to
//! a specific digest.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::events::{CoreEvent, EventBus};
use crate::peer::PeerHandle;
use crate::wire::{EnvironmentData, MessageDigest, CMD_SUBSCRIBE_ENVIRONMENT, CMD_UNSUBSCRIBE_ENVIRONMENT};

const ENVIRONMENT_CHANNEL_CAPACITY: usize = 64;

struct Subscription {
    listeners: usize,
    tx: tokio::sync::broadcast::Sender<serde_json::Value>,
}

/// Tracks listener refcounts per environment digest and keeps every peer's
/// server-side subscription state in sync with them.
pub struct EnvironmentSubscriptions {
    peers: Vec<PeerHandle>,
    subs: Mutex<HashMap<MessageDigest, Subscription>>,
    events: EventBus,
}

impl EnvironmentSubscriptions {
    pub fn new(peers: Vec<PeerHandle>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            peers,
            subs: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Registers a new listener for `digest`. Subscribes with every peer
    /// iff this is the first listener for that digest.
    pub fn subscribe(
        &self,
        digest: MessageDigest,
    ) -> tokio::sync::broadcast::Receiver<serde_json::Value> {
        let mut subs = self.subs.lock();
        if let Some(sub) = subs.get_mut(&digest) {
            sub.listeners += 1;
            return sub.tx.subscribe();
        }
        let (tx, rx) = tokio::sync::broadcast::channel(ENVIRONMENT_CHANNEL_CAPACITY);
        subs.insert(digest, Subscription { listeners: 1, tx });
        drop(subs);
        trace!(%digest, "first listener, subscribing with all peers");
        let text = serde_json::json!({
            "command": CMD_SUBSCRIBE_ENVIRONMENT,
            "environmentDigest": digest,
        })
        .to_string();
        for peer in &self.peers {
            peer.send_once(text.clone());
        }
        rx
    }

    /// Removes one listener for `digest`; sends command 6 to every peer
    /// once the last listener is gone.
    pub fn unsubscribe(&self, digest: MessageDigest) {
        let mut subs = self.subs.lock();
        let Some(sub) = subs.get_mut(&digest) else {
            return;
        };
        sub.listeners = sub.listeners.saturating_sub(1);
        if sub.listeners != 0 {
            return;
        }
        subs.remove(&digest);
        drop(subs);
        trace!(%digest, "last listener gone, unsubscribing with all peers");
        let text = serde_json::json!({
            "command": CMD_UNSUBSCRIBE_ENVIRONMENT,
            "environmentDigest": digest,
        })
        .to_string();
        for peer in &self.peers {
            peer.send_once(text.clone());
        }
    }

    /// Fans an inbound `data` push out to every current listener for its
    /// digest. A digest with no registered listener (e.g. one already
    /// unsubscribed) is dropped silently.
    pub fn handle_data(&self, data: EnvironmentData) {
        let subs = self.subs.lock();
        if let Some(sub) = subs.get(&data.environment_digest) {
            let _ = sub.tx.send(data.data.clone());
        }
        drop(subs);
        self.events.emit(CoreEvent::EnvironmentData {
            environment_digest: data.environment_digest,
            data: data.data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::peer::{spawn as spawn_peer, Connector, PeerSocket};
    use async_trait::async_trait;
    use std::time::Duration;
    use url::Url;

    struct NullConnector;
    #[async_trait]
    impl Connector for NullConnector {
        async fn connect(&self, _url: &Url) -> anyhow::Result<Box<dyn PeerSocket>> {
            anyhow::bail!("not used in this test")
        }
    }

    fn fake_peer() -> PeerHandle {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        spawn_peer(
            0,
            Url::parse("wss://example/").unwrap(),
            Arc::new(NullConnector),
            Duration::from_secs(3600),
            EventBus::new(),
            tx,
        )
    }

    #[tokio::test]
    async fn fans_out_data_to_every_listener() {
        let subs = EnvironmentSubscriptions::new(vec![fake_peer()], EventBus::new());
        let digest = MessageDigest([1u8; 32]);
        let mut a = subs.subscribe(digest);
        let mut b = subs.subscribe(digest);

        subs.handle_data(EnvironmentData {
            environment_digest: digest,
            data: serde_json::json!({"x": 1}),
        });

        assert_eq!(a.recv().await.unwrap(), serde_json::json!({"x": 1}));
        assert_eq!(b.recv().await.unwrap(), serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn also_emits_on_the_event_bus() {
        let events = EventBus::new();
        let mut bus_sub = events.subscribe();
        let subs = EnvironmentSubscriptions::new(vec![fake_peer()], events);
        let digest = MessageDigest([3u8; 32]);
        let _listener = subs.subscribe(digest);

        subs.handle_data(EnvironmentData {
            environment_digest: digest,
            data: serde_json::json!({"y": 2}),
        });

        match bus_sub.recv().await.unwrap() {
            CoreEvent::EnvironmentData { environment_digest, data } => {
                assert_eq!(environment_digest, digest);
                assert_eq!(data, serde_json::json!({"y": 2}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_is_refcounted() {
        let subs = EnvironmentSubscriptions::new(vec![fake_peer()], EventBus::new());
        let digest = MessageDigest([2u8; 32]);
        let _a = subs.subscribe(digest);
        let _b = subs.subscribe(digest);
        subs.unsubscribe(digest);
        // one listener remains; data still fans out.
        subs.handle_data(EnvironmentData {
            environment_digest: digest,
            data: serde_json::json!(null),
        });
        assert!(subs.subs.lock().contains_key(&digest));
        subs.unsubscribe(digest);
        assert!(!subs.subs.lock().contains_key(&digest));
    }
}
