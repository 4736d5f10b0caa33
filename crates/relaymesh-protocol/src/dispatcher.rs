/// Priority dispatcher — orders and rate-limits every outgoing send.
///
/// Items are kept in a strict total order: QoS class (highest first),
/// source peer score (highest first, snapshotted when the item is
/// queued), enqueue time (oldest first), then an enqueue sequence number.
/// At most `max_concurrent` sends are in flight at once.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::time::Instant;

use crate::error::MeshError;
use crate::event::MeshEvent;
use crate::healing::LatencyWindow;
use crate::reputation::{BehaviorEvent, BehaviorMetric, ReputationEngine};
use crate::stats::MeshStats;
use crate::transport::Transport;
use crate::types::{now_ms, PeerId, QosClass};

// ── Items ─────────────────────────────────────────────────────────────

/// A send request handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub payload: Vec<u8>,
    /// Directly connected neighbor the bytes go to.
    pub destination_id: PeerId,
    pub qos_class: QosClass,
    /// Peer the traffic originates from (the local node for own sends).
    pub source_peer_id: PeerId,
}

/// An item waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub id: u64,
    pub payload: Vec<u8>,
    pub destination_id: PeerId,
    pub qos_class: QosClass,
    pub source_peer_id: PeerId,
    pub enqueue_time: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct QueueKey {
    qos: QosClass,
    score: f64,
    enqueue_time: u64,
    seq: u64,
}

impl Ord for QueueKey {
    /// Smallest key is dispatched first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .qos
            .cmp(&self.qos)
            .then_with(|| other.score.total_cmp(&self.score))
            .then_with(|| self.enqueue_time.cmp(&other.enqueue_time))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

// ── Outcomes ──────────────────────────────────────────────────────────

/// Result of a successful `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { id: u64 },
    /// The queue was full; a lower-class item was dropped to make room.
    QueuedWithEviction { id: u64, evicted: u64 },
}

impl EnqueueOutcome {
    pub fn id(&self) -> u64 {
        match self {
            EnqueueOutcome::Queued { id } | EnqueueOutcome::QueuedWithEviction { id, .. } => *id,
        }
    }
}

/// Why an item left the queue without being sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SendDropReason {
    RetriesExhausted { last_error: String },
    /// Pushed out by a higher-class item.
    Evicted,
    /// No room when a failed item was requeued.
    QueueFull,
    Withdrawn,
    Shutdown,
}

/// Final result of one tracked item.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent { latency_ms: f64 },
    Dropped(SendDropReason),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct DispatcherParams {
    pub capacity: usize,
    pub max_concurrent: usize,
    pub retry_limit: u32,
}

impl Default for DispatcherParams {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_concurrent: 5,
            retry_limit: 3,
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: BTreeMap<QueueKey, QueuedItem>,
    index: HashMap<u64, QueueKey>,
    waiters: HashMap<u64, oneshot::Sender<SendOutcome>>,
    next_id: u64,
    next_seq: u64,
    /// Set by `close`; nothing enters the queue afterwards.
    closed: bool,
}

pub struct Dispatcher {
    queue: Mutex<QueueState>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    reputation: Arc<ReputationEngine>,
    latency: Arc<LatencyWindow>,
    stats: Arc<MeshStats>,
    events: mpsc::Sender<MeshEvent>,
    params: DispatcherParams,
}

impl Dispatcher {
    pub fn new(
        params: DispatcherParams,
        reputation: Arc<ReputationEngine>,
        latency: Arc<LatencyWindow>,
        stats: Arc<MeshStats>,
        events: mpsc::Sender<MeshEvent>,
    ) -> Self {
        let params = DispatcherParams {
            capacity: params.capacity.max(1),
            max_concurrent: params.max_concurrent.max(1),
            retry_limit: params.retry_limit,
        };
        Self {
            queue: Mutex::new(QueueState {
                next_id: 1,
                ..QueueState::default()
            }),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(params.max_concurrent)),
            reputation,
            latency,
            stats,
            events,
            params,
        }
    }

    /// Queue an item for sending.
    ///
    /// When the queue is full the item evicts the lowest-ordered queued
    /// item if that one has a strictly lower class; otherwise it is
    /// rejected with [`MeshError::QueueFull`]. A closed dispatcher refuses
    /// everything with [`MeshError::Shutdown`].
    pub fn enqueue(&self, item: OutboundItem) -> Result<EnqueueOutcome, MeshError> {
        self.enqueue_inner(item, None)
    }

    /// Like [`enqueue`](Self::enqueue), plus a receiver for the final outcome.
    pub fn enqueue_tracked(
        &self,
        item: OutboundItem,
    ) -> Result<(EnqueueOutcome, oneshot::Receiver<SendOutcome>), MeshError> {
        let (tx, rx) = oneshot::channel();
        let outcome = self.enqueue_inner(item, Some(tx))?;
        Ok((outcome, rx))
    }

    fn enqueue_inner(
        &self,
        item: OutboundItem,
        waiter: Option<oneshot::Sender<SendOutcome>>,
    ) -> Result<EnqueueOutcome, MeshError> {
        let score = self.reputation.score_or_neutral(&item.source_peer_id);
        let mut q = self.queue.lock();
        if q.closed {
            return Err(MeshError::Shutdown);
        }
        let id = q.next_id;
        q.next_id += 1;
        let queued = QueuedItem {
            id,
            payload: item.payload,
            destination_id: item.destination_id,
            qos_class: item.qos_class,
            source_peer_id: item.source_peer_id,
            enqueue_time: now_ms(),
            retry_count: 0,
        };

        let evicted = match self.make_room(&mut q, queued.qos_class) {
            Ok(evicted) => evicted,
            Err(()) => {
                self.stats.rejected.inc();
                tracing::warn!(id, qos = ?queued.qos_class, "queue full, item rejected");
                return Err(MeshError::QueueFull { rejected: id });
            }
        };
        if let Some(tx) = waiter {
            q.waiters.insert(id, tx);
        }
        self.insert(&mut q, queued, score);
        drop(q);

        self.stats.enqueued.inc();
        self.notify.notify_one();
        Ok(match evicted {
            Some(evicted) => EnqueueOutcome::QueuedWithEviction { id, evicted },
            None => EnqueueOutcome::Queued { id },
        })
    }

    /// Ensure there is room for one item of class `qos`.
    ///
    /// `Ok(Some(id))` when an item had to be evicted, `Err` when the queue
    /// is full of items at least as important.
    fn make_room(&self, q: &mut QueueState, qos: QosClass) -> Result<Option<u64>, ()> {
        if q.items.len() < self.params.capacity {
            return Ok(None);
        }
        let lowest = match q.items.last_key_value() {
            Some((key, _)) if key.qos < qos => *key,
            _ => return Err(()),
        };
        let Some(victim) = q.items.remove(&lowest) else {
            return Err(());
        };
        q.index.remove(&victim.id);
        self.stats.evicted.inc();
        tracing::debug!(id = victim.id, qos = ?victim.qos_class, "evicted for higher class");
        self.finish_dropped(q, &victim, SendDropReason::Evicted);
        Ok(Some(victim.id))
    }

    fn insert(&self, q: &mut QueueState, item: QueuedItem, score: f64) {
        let key = QueueKey {
            qos: item.qos_class,
            score,
            enqueue_time: item.enqueue_time,
            seq: q.next_seq,
        };
        q.next_seq += 1;
        q.index.insert(item.id, key);
        q.items.insert(key, item);
    }

    /// Remove a queued item before it is dispatched. Returns `false` if it
    /// was already taken (or never existed).
    pub fn withdraw(&self, id: u64) -> bool {
        let mut q = self.queue.lock();
        let Some(key) = q.index.remove(&id) else {
            return false;
        };
        let Some(item) = q.items.remove(&key) else {
            return false;
        };
        self.stats.withdrawn.inc();
        self.finish_dropped(&mut q, &item, SendDropReason::Withdrawn);
        true
    }

    /// Take the highest-priority item.
    pub fn pop(&self) -> Option<QueuedItem> {
        let mut q = self.queue.lock();
        let (_, item) = q.items.pop_first()?;
        q.index.remove(&item.id);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued ids in dispatch order.
    pub fn queued_ids(&self) -> Vec<u64> {
        self.queue.lock().items.values().map(|i| i.id).collect()
    }

    /// Record the result of one transport send.
    pub fn complete(&self, item: QueuedItem, result: Result<(), String>, latency_ms: f64) {
        match result {
            Ok(()) => {
                self.stats.sent.inc();
                self.latency.record(&item.destination_id, latency_ms);
                self.reputation.record_event(BehaviorEvent::new(
                    item.destination_id.clone(),
                    BehaviorMetric::Latency { ms: latency_ms },
                ));
                if let Some(tx) = self.queue.lock().waiters.remove(&item.id) {
                    let _ = tx.send(SendOutcome::Sent { latency_ms });
                }
                let _ = self.events.try_send(MeshEvent::SendCompleted {
                    item_id: item.id,
                    peer: item.destination_id,
                    latency_ms,
                });
            }
            Err(error) if item.retry_count < self.params.retry_limit => {
                tracing::debug!(id = item.id, to = %item.destination_id, retry = item.retry_count + 1, "send failed: {error}");
                self.stats.retried.inc();
                self.requeue(item);
            }
            Err(error) => {
                tracing::warn!(id = item.id, to = %item.destination_id, "send dropped after retries: {error}");
                let mut q = self.queue.lock();
                self.finish_dropped(
                    &mut q,
                    &item,
                    SendDropReason::RetriesExhausted { last_error: error },
                );
            }
        }
    }

    fn requeue(&self, mut item: QueuedItem) {
        item.retry_count += 1;
        item.enqueue_time = now_ms();
        let score = self.reputation.score_or_neutral(&item.source_peer_id);
        let mut q = self.queue.lock();
        if q.closed {
            // In flight when the node stopped; nobody drains the queue now.
            self.finish_dropped(&mut q, &item, SendDropReason::Shutdown);
            return;
        }
        match self.make_room(&mut q, item.qos_class) {
            Ok(_) => {
                self.insert(&mut q, item, score);
                drop(q);
                self.notify.notify_one();
            }
            Err(()) => self.finish_dropped(&mut q, &item, SendDropReason::QueueFull),
        }
    }

    fn finish_dropped(&self, q: &mut QueueState, item: &QueuedItem, reason: SendDropReason) {
        self.stats.send_dropped.inc();
        if let Some(tx) = q.waiters.remove(&item.id) {
            let _ = tx.send(SendOutcome::Dropped(reason.clone()));
        }
        let _ = self.events.try_send(MeshEvent::SendDropped {
            item_id: item.id,
            destination: item.destination_id.clone(),
            reason,
        });
    }

    /// Drop everything still queued, telling waiters the node shut down.
    /// Sends still in flight resolve as sent or as dropped on shutdown.
    pub fn close(&self) {
        let mut q = self.queue.lock();
        q.closed = true;
        let items: Vec<QueuedItem> = std::mem::take(&mut q.items).into_values().collect();
        q.index.clear();
        for item in &items {
            self.finish_dropped(&mut q, item, SendDropReason::Shutdown);
        }
    }

    /// Dispatch loop. Runs until `shutdown` flips to `true` (or its sender
    /// is dropped), then closes the queue.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn Transport>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(
            concurrency = self.params.max_concurrent,
            capacity = self.params.capacity,
            "dispatcher started"
        );
        'dispatch: loop {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let item = loop {
                if *shutdown.borrow() {
                    break 'dispatch;
                }
                if let Some(item) = self.pop() {
                    break item;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break 'dispatch;
                        }
                    }
                }
            };

            let this = Arc::clone(&self);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let started = Instant::now();
                let result = transport.send(&item.destination_id, &item.payload).await;
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                drop(permit);
                this.complete(item, result, latency_ms);
            });
        }
        self.close();
        tracing::debug!("dispatcher stopped");
    }
}
