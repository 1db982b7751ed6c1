//! Top-level orchestrator wiring Peer Sessions, the Sync Tracker, the
//! Request Router, and the Outbox Monitor together through a shared Event
//! Bus. A cheap, cloneable handle (`ConnectionCore`) around background
//! tasks that own all mutable state.

use std::sync::Arc;

use tracing::warn;

use crate::config::CoreConfig;
use crate::crypto::SignatureVerifier;
use crate::environment::EnvironmentSubscriptions;
use crate::events::EventBus;
use crate::outbox::{OutboxMonitor, OutboxStore};
use crate::peer::{self, Connector, PeerHandle};
use crate::router::RequestRouter;
use crate::sync_tracker::SyncTracker;
use crate::wire::Inbound;

pub struct ConnectionCore {
    peers: Vec<PeerHandle>,
    pub router: Arc<RequestRouter>,
    pub sync_tracker: Arc<SyncTracker>,
    pub outbox: Arc<OutboxMonitor>,
    pub environment: Arc<EnvironmentSubscriptions>,
    pub events: EventBus,
    watchdog_cancel: tokio_util::sync::CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ConnectionCore {
    /// Starts every Peer Session, the Sync Tracker watchdog, and the
    /// Outbox Monitor, and returns a handle once everything is wired.
    /// Individual peers connect asynchronously in the background; use
    /// `router.send_command` to wait for the first-Open barrier.
    pub fn start(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        verifier: Arc<dyn SignatureVerifier>,
        store: Arc<dyn OutboxStore>,
    ) -> Arc<Self> {
        let events = EventBus::new();
        let peer_count = config.peer_count();
        let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();

        // Subscribe before any peer session is spawned: peer sessions start
        // connecting immediately and emit `Open` the moment they succeed, and
        // `EventBus` is a broadcast channel that drops sends made with no
        // subscriber listening yet. Subscribing here and handing the
        // receiver straight to the router guarantees no `Open` (from even
        // the fastest `Connector`) can be missed before the router is
        // listening, which would otherwise hang `await_all_first_open`
        // forever for that peer.
        let router_sub = events.subscribe();

        let peers: Vec<PeerHandle> = config
            .computors
            .iter()
            .enumerate()
            .map(|(index, computor)| {
                peer::spawn(
                    index,
                    computor.url.clone(),
                    connector.clone(),
                    config.reconnect_timeout_duration,
                    events.clone(),
                    inbound_tx.clone(),
                )
            })
            .collect();
        drop(inbound_tx);

        let router = RequestRouter::with_subscription(peers.clone(), router_sub);
        let sync_tracker = SyncTracker::new(
            config.admin_public_key,
            verifier,
            peer_count,
            config.synchronization_interval,
            events.clone(),
        );
        let outbox = OutboxMonitor::new(store, router.clone(), events.clone());
        let environment = EnvironmentSubscriptions::new(peers.clone(), events.clone());

        let watchdog_cancel = tokio_util::sync::CancellationToken::new();
        let watchdog_task = tokio::spawn(
            sync_tracker
                .clone()
                .run_watchdog(watchdog_cancel.clone()),
        );
        let outbox_task = outbox.clone().spawn();

        let dispatch_router = router.clone();
        let dispatch_sync = sync_tracker.clone();
        let dispatch_events = events.clone();
        let dispatch_peers = peers.clone();
        let dispatch_environment = environment.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some((peer_index, text)) = inbound_rx.recv().await {
                match Inbound::parse(&text) {
                    Ok(Inbound::Info(payload)) => dispatch_sync.handle_info(peer_index, &payload),
                    Ok(Inbound::EnvironmentData(data)) => {
                        dispatch_environment.handle_data(data)
                    }
                    Ok(Inbound::EnvironmentUnsubscribeAck { .. }) => {}
                    Ok(other) => dispatch_router.handle_inbound(peer_index, other),
                    Err(e) => {
                        warn!(peer = peer_index, error = %e, "frame corrupted, forcing reconnect");
                        dispatch_events.emit(crate::events::CoreEvent::Error {
                            peer_index,
                            message: e.to_string(),
                        });
                        if let Some(handle) = dispatch_peers.get(peer_index) {
                            handle.force_reconnect();
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            peers,
            router,
            sync_tracker,
            outbox,
            environment,
            events,
            watchdog_cancel,
            tasks: vec![watchdog_task, outbox_task, dispatch_task],
        })
    }

    pub fn peer_endpoint(&self, index: usize) -> Option<url::Url> {
        self.peers.get(index).map(PeerHandle::endpoint)
    }

    pub fn set_peer_endpoint(&self, index: usize, url: url::Url) {
        if let Some(p) = self.peers.get(index) {
            p.set_endpoint(url);
        }
    }

    /// Closes every socket, cancels the watchdog, and stops the dispatch
    /// and outbox tasks. In-flight futures registered with the router are
    /// left unresolved — callers must apply their own timeout.
    pub fn terminate(&self) {
        self.watchdog_cancel.cancel();
        for peer in &self.peers {
            peer.terminate();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}
