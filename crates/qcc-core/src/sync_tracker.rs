//! Sync Tracker: turns independently-signed `(epoch, tick)` broadcasts
//! from each peer into a single agreed-upon sync level 0..N, with a
//! watchdog that demotes to 0 if no peer makes progress for too long.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::crypto::SignatureVerifier;
use crate::events::{CoreEvent, EventBus};
use crate::quorum::quorum_size;
use crate::wire::InfoPayload;

struct SyncState {
    latest_sync_level: usize,
    latest_progress: Instant,
    per_peer_last_status: Vec<Option<Vec<u8>>>,
}

pub struct SyncTracker {
    admin_public_key: [u8; 32],
    verifier: Arc<dyn SignatureVerifier>,
    peer_count: usize,
    synchronization_interval: Duration,
    events: EventBus,
    state: Mutex<SyncState>,
}

impl SyncTracker {
    pub fn new(
        admin_public_key: [u8; 32],
        verifier: Arc<dyn SignatureVerifier>,
        peer_count: usize,
        synchronization_interval: Duration,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            admin_public_key,
            verifier,
            peer_count,
            synchronization_interval,
            events,
            state: Mutex::new(SyncState {
                latest_sync_level: 0,
                latest_progress: Instant::now(),
                per_peer_last_status: vec![None; peer_count],
            }),
        })
    }

    pub fn latest_sync_level(&self) -> usize {
        self.state.lock().latest_sync_level
    }

    /// Handles an inbound command-0 frame from `peer_index`. Drops the
    /// payload silently on signature failure: a lying peer does not get
    /// credited with progress, but is not otherwise punished.
    pub fn handle_info(&self, peer_index: usize, payload: &InfoPayload) {
        let signed = payload.signed_bytes();
        if !self
            .verifier
            .verify(&self.admin_public_key, &signed, &payload.signature)
        {
            warn!(peer = peer_index, "info payload failed signature verification, dropping");
            return;
        }

        let raw = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(peer = peer_index, error = %e, "failed to serialize verified info payload");
                return;
            }
        };

        let mut state = self.state.lock();
        if peer_index >= state.per_peer_last_status.len() {
            return;
        }
        state.per_peer_last_status[peer_index] = Some(raw);
        let q = quorum_size(&state.per_peer_last_status);

        if q > state.latest_sync_level {
            state.latest_sync_level = q;
            state.latest_progress = Instant::now();
            trace!(sync_status = q, epoch = payload.epoch, tick = payload.tick, "sync level rose");
            self.events.emit(CoreEvent::Info {
                sync_status: q,
                epoch: Some(payload.epoch),
                tick: Some(payload.tick),
            });
        }

        if q == self.peer_count {
            debug!("full sync reached, resetting for next tick");
            state.per_peer_last_status = vec![None; self.peer_count];
            state.latest_sync_level = 0;
        }
    }

    /// Runs the recurring watchdog. Intended to be spawned as its own
    /// task; returns once `cancel` is cancelled.
    pub async fn run_watchdog(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.synchronization_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let demote = {
                        let mut state = self.state.lock();
                        let stale = state.latest_progress.elapsed() > self.synchronization_interval;
                        if stale && state.latest_sync_level != 0 {
                            state.latest_sync_level = 0;
                            state.per_peer_last_status = vec![None; self.peer_count];
                            true
                        } else {
                            stale
                        }
                    };
                    if demote {
                        debug!("watchdog: no progress within synchronization interval, demoting to 0");
                        self.events.emit(CoreEvent::Info { sync_status: 0, epoch: None, tick: None });
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_info(sk: &SigningKey, epoch: u32, tick: u16) -> InfoPayload {
        let mut buf = [0u8; 6];
        buf[0..4].copy_from_slice(&epoch.to_be_bytes());
        buf[4..6].copy_from_slice(&tick.to_be_bytes());
        let sig = sk.sign(&buf);
        InfoPayload {
            epoch,
            tick,
            signature: sig.to_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn rises_and_resets_on_full_sync() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let vk = sk.verifying_key().to_bytes();
        let tracker = SyncTracker::new(
            vk,
            Arc::new(Ed25519Verifier),
            3,
            Duration::from_secs(60),
            EventBus::new(),
        );
        let payload = signed_info(&sk, 10, 100);
        tracker.handle_info(0, &payload);
        assert_eq!(tracker.latest_sync_level(), 1);
        tracker.handle_info(1, &payload);
        assert_eq!(tracker.latest_sync_level(), 2);
        tracker.handle_info(2, &payload);
        // full sync resets immediately
        assert_eq!(tracker.latest_sync_level(), 0);
    }

    #[tokio::test]
    async fn drops_unverifiable_info() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let other_sk = SigningKey::from_bytes(&[9u8; 32]);
        let vk = sk.verifying_key().to_bytes();
        let tracker = SyncTracker::new(
            vk,
            Arc::new(Ed25519Verifier),
            3,
            Duration::from_secs(60),
            EventBus::new(),
        );
        let forged = signed_info(&other_sk, 10, 100);
        tracker.handle_info(0, &forged);
        assert_eq!(tracker.latest_sync_level(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_demotes_after_interval() {
        let sk = SigningKey::from_bytes(&[3u8; 32]);
        let vk = sk.verifying_key().to_bytes();
        let events = EventBus::new();
        let mut sub = events.subscribe();
        let tracker = SyncTracker::new(
            vk,
            Arc::new(Ed25519Verifier),
            3,
            Duration::from_millis(100),
            events,
        );
        let payload = signed_info(&sk, 1, 1);
        tracker.handle_info(0, &payload);
        assert_eq!(tracker.latest_sync_level(), 1);

        let cancel = tokio_util::sync::CancellationToken::new();
        let t = tracker.clone();
        let cancel_for_task = cancel.clone();
        let handle = tokio::spawn(async move { t.run_watchdog(cancel_for_task).await });

        tokio::time::advance(Duration::from_millis(250)).await;
        // let the watchdog task observe the advanced clock
        tokio::task::yield_now().await;

        let mut saw_demotion = false;
        while let Ok(ev) = sub.try_recv() {
            if let CoreEvent::Info { sync_status: 0, .. } = ev {
                saw_demotion = true;
            }
        }
        assert!(saw_demotion);
        assert_eq!(tracker.latest_sync_level(), 0);
        handle.abort();
    }
}
