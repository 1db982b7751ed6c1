//! End-to-end exercise of the wired-together core: peer sessions, the sync
//! tracker, the request router, and the outbox monitor, driven through a
//! scripted in-memory transport. Covers the transfer inclusion scenario:
//! a transfer is written to the durable outbox, the network reaches full
//! sync, and a quorum-agreed inclusion reply evicts the entry and emits
//! `inclusion`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use qcc_core::config::{ComputorConfig, CoreConfig};
use qcc_core::connection_core::ConnectionCore;
use qcc_core::crypto::Ed25519Verifier;
use qcc_core::events::CoreEvent;
use qcc_core::outbox::{OutboxEntry, OutboxStore, SledOutboxStore};
use qcc_core::peer::{Connector, PeerSocket};
use qcc_core::wire::MessageDigest;
use tokio::sync::mpsc;
use url::Url;

/// A socket fed by a per-peer unbounded channel the test writes frames
/// into, and that records every frame the core sends through it.
struct ScriptedSocket {
    index: usize,
    sent: Arc<Mutex<Vec<(usize, String)>>>,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl PeerSocket for ScriptedSocket {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.sent.lock().push((self.index, text));
        Ok(())
    }

    async fn recv_text(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.inbound.recv().await)
    }
}

/// Connects peer slot `N` (by its `wss://peerN/` URL) to a socket the test
/// can drive directly, never touching a real network.
struct ScriptedConnector {
    sent: Arc<Mutex<Vec<(usize, String)>>>,
    feeds: Arc<Mutex<HashMap<usize, mpsc::UnboundedSender<String>>>>,
    connects: AtomicUsize,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &Url) -> anyhow::Result<Box<dyn PeerSocket>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let index: usize = url
            .host_str()
            .unwrap()
            .trim_start_matches("peer")
            .parse()
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(index, tx);
        Ok(Box::new(ScriptedSocket {
            index,
            sent: self.sent.clone(),
            inbound: rx,
        }))
    }
}

impl ScriptedConnector {
    fn send_to_peer(&self, index: usize, frame: serde_json::Value) {
        let feeds = self.feeds.lock();
        let tx = feeds.get(&index).expect("peer not connected yet");
        tx.send(frame.to_string()).unwrap();
    }
}

fn signed_info(sk: &SigningKey, epoch: u32, tick: u16) -> serde_json::Value {
    let mut buf = [0u8; 6];
    buf[0..4].copy_from_slice(&epoch.to_be_bytes());
    buf[4..6].copy_from_slice(&tick.to_be_bytes());
    let sig = sk.sign(&buf);
    serde_json::json!({
        "command": 0,
        "epoch": epoch,
        "tick": tick,
        "signature": base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
    })
}

async fn wait_for_n_opens(core: &ConnectionCore, n: usize) {
    let mut sub = core.events.subscribe();
    let mut seen = std::collections::HashSet::new();
    while seen.len() < n {
        if let Ok(CoreEvent::Open { peer_index }) = sub.recv().await {
            seen.insert(peer_index);
        }
    }
}

#[tokio::test]
async fn transfer_inclusion_end_to_end() {
    let admin_sk = SigningKey::from_bytes(&[5u8; 32]);
    let admin_pk = admin_sk.verifying_key().to_bytes();

    let config = CoreConfig {
        computors: (0..3)
            .map(|i| ComputorConfig {
                url: Url::parse(&format!("wss://peer{i}/")).unwrap(),
                options: Default::default(),
            })
            .collect(),
        synchronization_interval: Duration::from_secs(60),
        admin_public_key: admin_pk,
        reconnect_timeout_duration: Duration::from_millis(50),
    };

    let sent = Arc::new(Mutex::new(Vec::new()));
    let feeds = Arc::new(Mutex::new(HashMap::new()));
    let connector = Arc::new(ScriptedConnector {
        sent: sent.clone(),
        feeds: feeds.clone(),
        connects: AtomicUsize::new(0),
    });

    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store = Arc::new(SledOutboxStore::open(&db).unwrap());

    let core = ConnectionCore::start(
        config,
        connector.clone(),
        Arc::new(Ed25519Verifier),
        store.clone(),
    );

    wait_for_n_opens(&core, 3).await;

    let digest = MessageDigest([9u8; 32]);
    core.outbox
        .put(
            digest,
            OutboxEntry {
                message: vec![1, 2, 3],
                signature: vec![4, 5, 6],
            },
        )
        .await
        .unwrap();

    let mut events = core.events.subscribe();

    // Drive the sync tracker to full N-agreement so the outbox monitor's
    // `syncStatus > 2` gate fires and it issues a command-4 status query.
    for i in 0..3 {
        connector.send_to_peer(i, signed_info(&admin_sk, 10, 100));
    }

    // Wait for the status request to actually go out before answering it.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if sent.lock().iter().any(|(_, f)| f.contains("\"command\":4")) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("outbox monitor never issued a status query");

    let reply = serde_json::json!({
        "command": 4,
        "messageDigest": digest.to_hex(),
        "inclusionState": true,
        "tick": 100u16,
        "epoch": 10u32,
    });
    connector.send_to_peer(0, reply.clone());
    connector.send_to_peer(1, reply);

    let inclusion = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                CoreEvent::Inclusion {
                    digest: d,
                    inclusion_state,
                    tick,
                    epoch,
                } if d == digest => return (inclusion_state, tick, epoch),
                _ => continue,
            }
        }
    })
    .await
    .expect("no inclusion event observed");

    assert_eq!(inclusion, (true, 100, 10));
    assert!(store.get(digest).await.unwrap().is_none(), "entry must be evicted on inclusion");

    core.terminate();
}
