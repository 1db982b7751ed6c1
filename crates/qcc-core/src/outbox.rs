//! Outbox Monitor: a durable digest -> signed-transfer map, polled for
//! inclusion status on every sufficiently-synced `info` transition.
//!
//! The durable store is behind the [`OutboxStore`] trait so the monitor
//! itself never touches `sled` directly; [`SledOutboxStore`] is the
//! concrete implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{CoreEvent, EventBus};
use crate::router::RequestRouter;
use crate::wire::{MessageDigest, StatusReply, StatusRequest, CMD_STATUS};

/// Majority-of-N sync level before polling status is worthwhile in
/// general; the monitor itself gates on full N-sync (see
/// `FULL_SYNC_THRESHOLD`).
const FULL_SYNC_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Durable key-value collaborator
/// (`durable_store.put/.del/.get/.key_stream`).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn put(&self, digest: MessageDigest, entry: OutboxEntry) -> Result<()>;
    async fn del(&self, digest: MessageDigest) -> Result<()>;
    async fn get(&self, digest: MessageDigest) -> Result<Option<OutboxEntry>>;
    async fn list(&self) -> Result<Vec<(MessageDigest, OutboxEntry)>>;
}

/// `sled`-backed implementation: one tree keyed by the raw 32-byte digest.
pub struct SledOutboxStore {
    tree: sled::Tree,
}

impl SledOutboxStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree("outbox")?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl OutboxStore for SledOutboxStore {
    async fn put(&self, digest: MessageDigest, entry: OutboxEntry) -> Result<()> {
        let bytes = serde_json::to_vec(&entry)?;
        self.tree.insert(digest.0, bytes)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn del(&self, digest: MessageDigest) -> Result<()> {
        self.tree.remove(digest.0)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn get(&self, digest: MessageDigest) -> Result<Option<OutboxEntry>> {
        match self.tree.get(digest.0)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<(MessageDigest, OutboxEntry)>> {
        let mut out = Vec::new();
        for kv in self.tree.iter() {
            let (k, v) = kv?;
            let mut arr = [0u8; 32];
            if k.len() == 32 {
                arr.copy_from_slice(&k);
                out.push((MessageDigest(arr), serde_json::from_slice(&v)?));
            }
        }
        Ok(out)
    }
}

/// Ties the durable outbox to the Sync Tracker's `info` transitions and
/// the Request Router's status queries.
pub struct OutboxMonitor {
    store: Arc<dyn OutboxStore>,
    router: Arc<RequestRouter>,
    events: EventBus,
}

impl OutboxMonitor {
    pub fn new(store: Arc<dyn OutboxStore>, router: Arc<RequestRouter>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            store,
            router,
            events,
        })
    }

    /// Write-ahead: the transfer pipeline calls this before submitting
    /// command 3, so a crash between durable write and network send can
    /// be retried; a crash before the write only loses an unreplicated
    /// attempt.
    pub async fn put(&self, digest: MessageDigest, entry: OutboxEntry) -> Result<()> {
        self.store.put(digest, entry).await
    }

    /// Spawns the background task that installs a one-shot `info`
    /// listener per outstanding digest (existing entries at launch, and
    /// any new `put`). Intended to run for the lifetime of the core.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        // Subscribe before the task even starts running (and before the
        // initial `list()` load completes) so a sync transition that fires
        // while this monitor is still starting up is never missed.
        let mut sub = self.events.subscribe();
        tokio::spawn(async move {
            let mut outstanding = match self.store.list().await {
                Ok(entries) => entries.into_iter().map(|(d, _)| d).collect::<Vec<_>>(),
                Err(e) => {
                    warn!(error = %e, "failed to load outbox at startup");
                    Vec::new()
                }
            };

            loop {
                match sub.recv().await {
                    Ok(CoreEvent::Info { sync_status, .. }) if sync_status > FULL_SYNC_THRESHOLD => {
                        for digest in outstanding.clone() {
                            self.poll_digest(digest).await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                }
                // Pick up digests `put` since the last scan, whatever
                // kind of event just woke us up.
                if let Ok(entries) = self.store.list().await {
                    outstanding = entries.into_iter().map(|(d, _)| d).collect();
                }
            }
        })
    }

    async fn poll_digest(&self, digest: MessageDigest) {
        let payload = serde_json::to_value(StatusRequest {
            message_digest: digest,
        })
        .expect("StatusRequest always serializes");
        let outcome = self
            .router
            .send_command(CMD_STATUS, payload, digest.to_hex())
            .await;

        match outcome {
            Ok(crate::wire::Inbound::Status(StatusReply::Included {
                message_digest,
                inclusion_state: true,
                tick,
                epoch,
            })) => {
                debug!(%message_digest, "inclusion confirmed, evicting");
                if let Err(e) = self.store.del(message_digest).await {
                    warn!(error = %e, "failed to delete included outbox entry");
                }
                self.events.emit(CoreEvent::Inclusion {
                    digest: message_digest,
                    inclusion_state: true,
                    tick,
                    epoch,
                });
            }
            Ok(crate::wire::Inbound::Status(StatusReply::Rejected {
                message_digest,
                reason,
            })) => {
                // Deliberately does not delete the entry or detach the
                // listener on rejection, so the same digest is re-queried
                // on every future sync transition until it is either
                // included or manually evicted. See DESIGN.md.
                self.events.emit(CoreEvent::Rejection {
                    digest: message_digest,
                    reason,
                });
            }
            Ok(crate::wire::Inbound::Status(StatusReply::Included {
                inclusion_state: false,
                ..
            })) => {
                // Not yet included; stay attached for the next transition.
            }
            Ok(_) => {
                warn!("status query returned an unexpected reply kind");
            }
            Err(e) => {
                warn!(%digest, error = %e, "status query failed, will retry on next sync transition");
            }
        }
    }
}
