use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::dispatcher::{Dispatcher, DispatcherParams, OutboundItem};
use crate::error::MeshError;
use crate::event::MeshEvent;
use crate::forwarding::{DropReason, Forwarder, RelayDecision, RelayMode};
use crate::healing::{HealDecision, HealthMonitor, LatencyWindow, MonitorParams, SlowPeerChange};
use crate::ledger::{
    EntryStatus, IngestOutcome, LamportClock, Ledger, LedgerEntry, LedgerError, SyncBatch, SyncRequest,
    Transaction,
};
use crate::message::{MeshMessage, MessageKind};
use crate::multipath::{MultiPathReport, MultiPathRouter, RouterParams};
use crate::reputation::{BehaviorEvent, BehaviorMetric, ReputationEngine, ReputationParams};
use crate::stats::MeshStats;
use crate::transport::Transport;
use crate::types::{now_ms, PeerId, QosClass};

/// Capacity of the node → application event channel.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// What one health-check cycle did.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HealthReport {
    pub decision: HealDecision,
    pub reconnected: Vec<PeerId>,
    pub discovered: Vec<PeerId>,
    pub routes_dropped: usize,
    pub slow_peers: Vec<SlowPeerChange>,
}

/// A mesh participant: forwarding, reputation, routing, dispatch,
/// healing and ledger, bound to one transport.
pub struct MeshNode {
    local_id: PeerId,
    signing_key: Option<SigningKey>,
    config: MeshConfig,
    reputation: Arc<ReputationEngine>,
    forwarder: Mutex<Forwarder>,
    router: MultiPathRouter,
    dispatcher: Arc<Dispatcher>,
    monitor: HealthMonitor,
    latency: Arc<LatencyWindow>,
    ledger: Ledger,
    clock: Mutex<LamportClock>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<MeshEvent>,
    stats: Arc<MeshStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Build a node. Nothing runs until [`start`](Self::start).
    pub fn new(
        local_id: PeerId,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::Receiver<MeshEvent>) {
        Self::build(local_id, None, config, transport)
    }

    /// Build a node whose id is the hex of `key`'s verifying key. Only
    /// keyed nodes can create and countersign ledger entries.
    pub fn with_key(
        key: SigningKey,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::Receiver<MeshEvent>) {
        let local_id = PeerId::from_verifying_key(&key.verifying_key());
        Self::build(local_id, Some(key), config, transport)
    }

    fn build(
        local_id: PeerId,
        signing_key: Option<SigningKey>,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::Receiver<MeshEvent>) {
        let config = config.sanitized();
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let reputation = Arc::new(ReputationEngine::new(ReputationParams {
            alpha: config.reputation_alpha,
            latency_ceiling_ms: config.latency_ceiling_ms,
        }));
        let latency = Arc::new(LatencyWindow::new());
        let stats = Arc::new(MeshStats::new());
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherParams {
                capacity: config.queue_capacity,
                max_concurrent: config.max_concurrent_sends,
                retry_limit: config.retry_limit,
            },
            reputation.clone(),
            latency.clone(),
            stats.clone(),
            events.clone(),
        ));
        let router = MultiPathRouter::new(
            local_id.clone(),
            RouterParams {
                blacklist_threshold: config.blacklist_threshold,
                max_paths: config.max_paths,
                default_ttl: config.default_ttl,
                routes_per_destination: config.routes_per_destination,
            },
            reputation.clone(),
            dispatcher.clone(),
        );
        let monitor = HealthMonitor::new(MonitorParams {
            churn_threshold: config.churn_threshold,
            slow_latency_ms: config.slow_latency_ms,
            slow_score_floor: config.slow_score_floor,
        });
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            forwarder: Mutex::new(Forwarder::new(local_id.clone(), config.processed_capacity)),
            clock: Mutex::new(LamportClock::new(local_id.clone())),
            ledger: Ledger::new(config.witness_threshold),
            local_id,
            signing_key,
            config,
            reputation,
            router,
            dispatcher,
            monitor,
            latency,
            transport,
            events,
            stats,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        (node, events_rx)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Learn the current neighbors and spawn the dispatch and monitor loops.
    pub async fn start(self: &Arc<Self>) {
        for peer in self.transport.connected_peers().await {
            self.router.add_neighbor(peer.clone());
            self.monitor.note_connected(&peer);
        }
        let dispatch = tokio::spawn(
            self.dispatcher
                .clone()
                .run(self.transport.clone(), self.shutdown.subscribe()),
        );
        let monitor = tokio::spawn(super::r#loop::monitor_loop(
            Arc::clone(self),
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().extend([dispatch, monitor]);
        tracing::info!(node = %self.local_id, neighbors = self.router.neighbors().len(), "mesh node started");
    }

    /// Stop every task and drop queued sends.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!("task ended abnormally: {e}");
            }
        }
        self.dispatcher.close();
        tracing::info!(node = %self.local_id, "mesh node stopped");
    }

    pub(super) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(super) fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn reputation(&self) -> &Arc<ReputationEngine> {
        &self.reputation
    }

    pub fn router(&self) -> &MultiPathRouter {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn stats(&self) -> &Arc<MeshStats> {
        &self.stats
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.try_send(event).is_err() {
            tracing::trace!(node = %self.local_id, "event channel full, event dropped");
        }
    }

    // ── Transport callbacks ─────────────────────────────────────────

    pub fn handle_peer_connected(&self, peer: &PeerId) {
        if self.router.add_neighbor(peer.clone()) {
            tracing::debug!(node = %self.local_id, %peer, "peer connected");
            self.emit(MeshEvent::PeerConnected { peer: peer.clone() });
        }
        self.monitor.note_connected(peer);
    }

    pub fn handle_peer_disconnected(&self, peer: &PeerId) {
        if self.router.remove_neighbor(peer) {
            tracing::debug!(node = %self.local_id, %peer, "peer disconnected");
            self.emit(MeshEvent::PeerDisconnected { peer: peer.clone() });
        }
        self.monitor.note_disconnected(peer);
    }

    /// Process bytes received from neighbor `from`. Never blocks: relays
    /// and replies are queued, not sent inline.
    pub fn handle_incoming(self: &Arc<Self>, from: &PeerId, bytes: &[u8]) -> Result<(), MeshError> {
        let message = match MeshMessage::from_bytes(bytes) {
            Ok(m) => m,
            Err(e) => {
                self.stats.decode_errors.inc();
                tracing::warn!(node = %self.local_id, %from, "undecodable frame: {e}");
                return Err(e);
            }
        };
        self.handle_peer_connected(from);
        self.learn_from_trail(from, &message);

        let message_id = message.message_id.clone();
        let decision = self.forwarder.lock().relay(message, from);
        match decision {
            RelayDecision::Deliver(message) => self.deliver(message, from),
            RelayDecision::Relay { message, mode } => self.relay(message, mode, from),
            RelayDecision::Drop(reason) => {
                match reason {
                    DropReason::TtlExhausted => self.stats.ttl_exhausted.inc(),
                    DropReason::Duplicate | DropReason::DuplicatePath => self.stats.duplicates.inc(),
                }
                self.emit(MeshEvent::MessageDropped { message_id, reason });
                Ok(())
            }
        }
    }

    /// Every prefix of the reversed trail is a route back to a node the
    /// message passed through.
    fn learn_from_trail(&self, from: &PeerId, message: &MeshMessage) {
        if message.trail.last() != Some(from) {
            tracing::debug!(node = %self.local_id, %from, "trail does not end at sender, not learned");
            return;
        }
        let back = message.return_route();
        for len in 1..=back.len() {
            self.router.learn_route(back[..len].to_vec());
        }
    }

    fn deliver(self: &Arc<Self>, message: MeshMessage, from: &PeerId) -> Result<(), MeshError> {
        self.stats.delivered.inc();
        match message.kind {
            MessageKind::Data => {
                tracing::debug!(node = %self.local_id, id = %message.message_id, origin = %message.origin_id, "delivered");
                self.emit(MeshEvent::Delivered {
                    message_id: message.message_id,
                    origin: message.origin_id,
                    qos: message.qos_class,
                    payload: message.payload,
                });
                Ok(())
            }
            MessageKind::LedgerEntry => self.receive_ledger_entry(message, from),
            MessageKind::LedgerSync => self.answer_sync(message),
            MessageKind::LedgerBatch => self.receive_sync_batch(message, from),
        }
    }

    fn relay(&self, mut message: MeshMessage, mode: RelayMode, from: &PeerId) -> Result<(), MeshError> {
        let neighbors = self.router.neighbors();
        let targets: Vec<PeerId> = match mode {
            RelayMode::Directed(next) if self.router.is_neighbor(&next) => vec![next],
            RelayMode::Directed(next) => {
                tracing::debug!(node = %self.local_id, %next, "source route broken, rerouting");
                self.directed_or_flood(&mut message, &neighbors, None)
            }
            RelayMode::Flood { exclude } => self.directed_or_flood(&mut message, &neighbors, Some(&exclude)),
        };
        let targets: Vec<PeerId> = targets
            .into_iter()
            .filter(|p| !message.trail.contains(p))
            .collect();
        if targets.is_empty() {
            tracing::debug!(node = %self.local_id, id = %message.message_id, "nowhere left to relay");
            return Ok(());
        }

        let bytes = message.to_bytes()?;
        let mut queued = 0;
        for target in &targets {
            let item = OutboundItem {
                payload: bytes.clone(),
                destination_id: target.clone(),
                qos_class: message.qos_class,
                source_peer_id: from.clone(),
            };
            match self.dispatcher.enqueue(item) {
                Ok(_) => queued += 1,
                Err(e) => tracing::warn!(node = %self.local_id, to = %target, "relay not queued: {e}"),
            }
        }
        self.stats.relayed.inc();
        self.emit(MeshEvent::Relayed {
            message_id: message.message_id,
            next_hops: queued,
        });
        Ok(())
    }

    /// Pin the message to the best known route if one avoids its trail,
    /// else flood to every neighbor but `exclude`.
    fn directed_or_flood(
        &self,
        message: &mut MeshMessage,
        neighbors: &[PeerId],
        exclude: Option<&PeerId>,
    ) -> Vec<PeerId> {
        if let Some(route) = self.router.best_route(&message.destination_id) {
            let loops = route.hops().iter().any(|p| message.trail.contains(p));
            if !loops && Some(route.first_hop()) != exclude {
                let next = route.first_hop().clone();
                message.route = route.hops().to_vec();
                return vec![next];
            }
        }
        neighbors
            .iter()
            .filter(|p| Some(*p) != exclude)
            .cloned()
            .collect()
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Multi-path send over the best known routes.
    ///
    /// Fails with [`MeshError::NoViableRoute`] (and sends nothing) when no
    /// route survives the blacklist.
    pub async fn send(
        &self,
        destination: &PeerId,
        payload: Vec<u8>,
        qos: QosClass,
    ) -> Result<MultiPathReport, MeshError> {
        self.send_kind(destination, payload, qos, MessageKind::Data).await
    }

    async fn send_kind(
        &self,
        destination: &PeerId,
        payload: Vec<u8>,
        qos: QosClass,
        kind: MessageKind,
    ) -> Result<MultiPathReport, MeshError> {
        let plan = self
            .router
            .plan(destination, payload, qos, self.config.max_paths, kind)?;
        {
            let mut forwarder = self.forwarder.lock();
            for (_, message) in &plan.paths {
                forwarder.originate(message)?;
            }
        }
        self.router.execute(plan).await
    }

    /// Flood a message to every neighbor. Relays pick up learned routes on
    /// the way. Returns the message id.
    pub fn flood(
        &self,
        destination: &PeerId,
        payload: Vec<u8>,
        qos: QosClass,
        ttl: u32,
    ) -> Result<String, MeshError> {
        self.flood_kind(destination, payload, qos, ttl, MessageKind::Data)
    }

    fn flood_kind(
        &self,
        destination: &PeerId,
        payload: Vec<u8>,
        qos: QosClass,
        ttl: u32,
        kind: MessageKind,
    ) -> Result<String, MeshError> {
        let message = MeshMessage::new(self.local_id.clone(), destination.clone(), ttl, qos, payload)
            .with_kind(kind);
        self.forwarder.lock().originate(&message)?;

        let neighbors = self.router.neighbors();
        if neighbors.is_empty() {
            return Err(MeshError::NoViableRoute {
                destination: destination.to_string(),
            });
        }
        let bytes = message.to_bytes()?;
        for peer in neighbors {
            self.dispatcher.enqueue(OutboundItem {
                payload: bytes.clone(),
                destination_id: peer,
                qos_class: qos,
                source_peer_id: self.local_id.clone(),
            })?;
        }
        tracing::debug!(node = %self.local_id, id = %message.message_id, %destination, ttl, "flooded");
        Ok(message.message_id)
    }

    /// Routed send that falls back to a flood when no route is known.
    async fn send_or_flood(
        &self,
        destination: &PeerId,
        payload: Vec<u8>,
        qos: QosClass,
        kind: MessageKind,
    ) -> Result<(), MeshError> {
        match self.send_kind(destination, payload.clone(), qos, kind).await {
            Ok(report) if report.any_sent() => Ok(()),
            Ok(_) | Err(MeshError::NoViableRoute { .. }) => self
                .flood_kind(destination, payload, qos, self.config.default_ttl, kind)
                .map(|_| ()),
            Err(e) => Err(e),
        }
    }

    // ── Ledger ───────────────────────────────────────────────────────

    /// Record a transfer to `receiver` and ship the entry to it. The entry
    /// stays pending until the receiver countersigns it, or until
    /// `ledger_accept_timeout` runs out and the next `pay` rejects it.
    pub async fn pay(
        &self,
        receiver: &PeerId,
        amount: u64,
        coin_type_id: &str,
    ) -> Result<LedgerEntry, MeshError> {
        let key = self.signing_key.as_ref().ok_or_else(|| LedgerError::UnknownKey {
            peer: self.local_id.clone(),
        })?;
        self.expire_stale_head();
        let lamport = self.clock.lock().tick();
        let transaction = Transaction::new(self.local_id.clone(), receiver.clone(), amount, coin_type_id);
        let entry = self.ledger.append(transaction, lamport, key, None)?;
        self.emit(MeshEvent::LedgerEntryStored {
            entry_id: entry.entry_id.clone(),
            sender: entry.sender_id.clone(),
            status: entry.status,
        });
        self.ship_entry(&entry, receiver).await?;
        Ok(entry)
    }

    async fn ship_entry(&self, entry: &LedgerEntry, to: &PeerId) -> Result<(), MeshError> {
        let payload = entry.to_bytes()?;
        self.send_or_flood(to, payload, QosClass::Critical, MessageKind::LedgerEntry)
            .await
    }

    /// `from` is the neighbor that handed over the frame; a forged entry
    /// is held against it, not against the origin the frame claims.
    fn receive_ledger_entry(self: &Arc<Self>, message: MeshMessage, from: &PeerId) -> Result<(), MeshError> {
        let entry = match LedgerEntry::from_bytes(&message.payload) {
            Ok(e) => e,
            Err(e) => {
                self.emit(MeshEvent::LedgerEntryRejected {
                    entry_id: String::new(),
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let entry_id = entry.entry_id.clone();
        // Relays on the trail carried the entry.
        match self.take_entry(entry, message.trail.get(1..).unwrap_or_default()) {
            Ok(()) => Ok(()),
            Err(LedgerError::SequenceGap { sender, expected, found }) if found > expected => {
                tracing::debug!(node = %self.local_id, %sender, expected, found, "chain behind, asking for backfill");
                self.request_backfill(sender, expected);
                Ok(())
            }
            Err(e) => {
                self.refuse_entry(entry_id, &e, from);
                Err(e.into())
            }
        }
    }

    /// Ingest one entry, credit its witnesses, report it and countersign
    /// it if it is addressed to us.
    fn take_entry(self: &Arc<Self>, entry: LedgerEntry, witnesses: &[PeerId]) -> Result<(), LedgerError> {
        let stored = self.ingest_entry(entry)?.entry().clone();
        for peer in witnesses {
            let _ = self.ledger.record_witness(&stored.entry_id, peer);
        }
        self.emit(MeshEvent::LedgerEntryStored {
            entry_id: stored.entry_id.clone(),
            sender: stored.sender_id.clone(),
            status: stored.status,
        });
        self.countersign(stored);
        Ok(())
    }

    fn refuse_entry(&self, entry_id: String, err: &LedgerError, from: &PeerId) {
        if matches!(err, LedgerError::InvalidSignature { .. } | LedgerError::HashMismatch { .. }) {
            self.reputation
                .record_event(BehaviorEvent::new(from.clone(), BehaviorMetric::ForgeryAttempt));
        }
        self.emit(MeshEvent::LedgerEntryRejected {
            entry_id,
            reason: err.to_string(),
        });
    }

    /// Ask `sender` for its chain from `from_sequence` on.
    fn request_backfill(self: &Arc<Self>, sender: PeerId, from_sequence: u64) {
        let request = SyncRequest {
            sender: sender.clone(),
            from_sequence,
        };
        let payload = match request.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(node = %self.local_id, "backfill request not encoded: {e}");
                return;
            }
        };
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = node
                .send_or_flood(&sender, payload, QosClass::Critical, MessageKind::LedgerSync)
                .await
            {
                tracing::warn!(node = %node.local_id, %sender, "backfill request not sent: {e}");
            }
        });
    }

    /// Send the requester the part of our own chain it is missing.
    fn answer_sync(self: &Arc<Self>, message: MeshMessage) -> Result<(), MeshError> {
        let request = SyncRequest::from_bytes(&message.payload)?;
        if request.sender != self.local_id {
            tracing::debug!(node = %self.local_id, sender = %request.sender, "backfill request for another chain");
            return Ok(());
        }
        let batch = SyncBatch::answer(&request, self.ledger.entries_for(&self.local_id));
        if batch.entries.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            node = %self.local_id,
            to = %message.origin_id,
            from_sequence = request.from_sequence,
            entries = batch.entries.len(),
            "answering backfill"
        );
        let payload = batch.to_bytes()?;
        let node = Arc::clone(self);
        let requester = message.origin_id;
        tokio::spawn(async move {
            if let Err(e) = node
                .send_or_flood(&requester, payload, QosClass::Critical, MessageKind::LedgerBatch)
                .await
            {
                tracing::warn!(node = %node.local_id, %requester, "backfill not sent: {e}");
            }
        });
        Ok(())
    }

    /// Ingest a backfill in order. Entries already held unchanged are
    /// skipped; the first one that fails ends the batch.
    fn receive_sync_batch(self: &Arc<Self>, message: MeshMessage, from: &PeerId) -> Result<(), MeshError> {
        let batch = SyncBatch::from_bytes(&message.payload)?;
        let mut taken = 0;
        for entry in batch.entries {
            if entry.sender_id != batch.sender {
                break;
            }
            if self
                .ledger
                .get(&entry.entry_id)
                .is_some_and(|held| held.entry_hash == entry.entry_hash)
            {
                continue;
            }
            let entry_id = entry.entry_id.clone();
            if let Err(e) = self.take_entry(entry, &[]) {
                self.refuse_entry(entry_id, &e, from);
                break;
            }
            taken += 1;
        }
        tracing::debug!(node = %self.local_id, sender = %batch.sender, taken, "backfill ingested");
        Ok(())
    }

    fn ingest_entry(&self, entry: LedgerEntry) -> Result<IngestOutcome, LedgerError> {
        let sender_pk = entry.sender_id.verifying_key().ok_or_else(|| LedgerError::UnknownKey {
            peer: entry.sender_id.clone(),
        })?;
        let receiver_pk = entry.receiver_id.verifying_key();
        self.clock.lock().observe(&entry.lamport_timestamp);
        self.ledger.ingest(entry, &sender_pk, receiver_pk.as_ref())
    }

    /// Reject our own pending head once it has waited longer than
    /// `ledger_accept_timeout` for the receiver.
    fn expire_stale_head(&self) {
        let Some(head) = self.ledger.head(&self.local_id) else {
            return;
        };
        let waited = now_ms().saturating_sub(head.wall_clock_time);
        if head.status != EntryStatus::Pending
            || u128::from(waited) < self.config.ledger_accept_timeout.as_millis()
        {
            return;
        }
        match self.ledger.reject(&head.entry_id) {
            Ok(rejected) => {
                tracing::warn!(
                    node = %self.local_id,
                    entry = %rejected.entry_id,
                    waited_ms = waited,
                    "no countersignature, entry rejected"
                );
                self.emit(MeshEvent::LedgerEntryStored {
                    entry_id: rejected.entry_id,
                    sender: rejected.sender_id,
                    status: rejected.status,
                });
            }
            Err(e) => tracing::debug!(node = %self.local_id, "stale head not rejected: {e}"),
        }
    }

    /// As receiver of a pending entry, accept it and send it back.
    fn countersign(self: &Arc<Self>, entry: LedgerEntry) {
        if entry.status != EntryStatus::Pending || entry.receiver_id != self.local_id {
            return;
        }
        let Some(key) = &self.signing_key else {
            return;
        };
        let accepted = match self.ledger.accept(&entry, key) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(node = %self.local_id, entry = %entry.entry_id, "accept failed: {e}");
                return;
            }
        };
        self.emit(MeshEvent::LedgerEntryStored {
            entry_id: accepted.entry_id.clone(),
            sender: accepted.sender_id.clone(),
            status: accepted.status,
        });
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let sender = accepted.sender_id.clone();
            if let Err(e) = node.ship_entry(&accepted, &sender).await {
                tracing::warn!(node = %node.local_id, "countersigned entry not sent: {e}");
            }
        });
    }

    // ── Healing ──────────────────────────────────────────────────────

    /// One monitor cycle: expire a stale pending payment, reconcile
    /// neighbors with the transport, decide on churn, carry out the heal,
    /// then handle slow peers.
    pub async fn run_health_check(&self) -> HealthReport {
        self.monitor.begin_cycle();
        self.expire_stale_head();
        let connected = self.transport.connected_peers().await;

        for peer in self.router.neighbors() {
            if !connected.contains(&peer) {
                self.handle_peer_disconnected(&peer);
            }
        }
        for peer in &connected {
            self.router.add_neighbor(peer.clone());
            self.reputation.record_event(BehaviorEvent::new(
                peer.clone(),
                BehaviorMetric::Availability { uptime: 1.0 },
            ));
        }

        let decision = self.monitor.observe(&connected);
        let mut report = HealthReport {
            decision: decision.clone(),
            reconnected: Vec::new(),
            discovered: Vec::new(),
            routes_dropped: 0,
            slow_peers: Vec::new(),
        };

        match &decision {
            HealDecision::NoAction => {}
            HealDecision::SoftHeal { reconnect } => {
                for peer in reconnect {
                    self.record_unavailable(peer);
                    match self.reconnect(peer).await {
                        Ok(()) => report.reconnected.push(peer.clone()),
                        Err(e) => tracing::debug!(node = %self.local_id, %peer, "reconnect failed: {e}"),
                    }
                }
                tracing::info!(node = %self.local_id, reconnected = report.reconnected.len(), "soft heal");
            }
            HealDecision::AggressiveHeal { dropped, discover } => {
                for peer in dropped {
                    self.record_unavailable(peer);
                }
                report.routes_dropped = self.router.recalculate(&connected);
                for peer in self.transport.discover(*discover).await {
                    self.handle_peer_connected(&peer);
                    report.discovered.push(peer);
                }
                tracing::info!(
                    node = %self.local_id,
                    dropped = dropped.len(),
                    discovered = report.discovered.len(),
                    routes_dropped = report.routes_dropped,
                    "aggressive heal"
                );
            }
        }
        if decision != HealDecision::NoAction {
            self.emit(MeshEvent::Healed { decision });
        }

        report.slow_peers = self
            .monitor
            .check_latency(&connected, &self.latency, &self.reputation);
        for change in &report.slow_peers {
            self.emit(MeshEvent::SlowPeer {
                change: change.clone(),
            });
        }
        report
    }

    /// Re-establish the direct link to `peer` and take it back as a
    /// neighbor.
    pub async fn reconnect(&self, peer: &PeerId) -> Result<(), MeshError> {
        self.transport
            .reconnect(peer)
            .await
            .map_err(MeshError::Transport)?;
        self.handle_peer_connected(peer);
        Ok(())
    }

    fn record_unavailable(&self, peer: &PeerId) {
        self.reputation.record_event(BehaviorEvent::new(
            peer.clone(),
            BehaviorMetric::Availability { uptime: 0.0 },
        ));
    }
}
