/// Multi-path routing — route table, route scoring and parallel sends.
///
/// Candidate routes come from direct neighbors and from reverse trails
/// learned by the forwarding layer. Selection is pure; `MultiPathRouter`
/// adds the dispatch over the priority queue and the reputation feedback.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::dispatcher::{Dispatcher, OutboundItem, SendDropReason, SendOutcome};
use crate::error::MeshError;
use crate::message::{MeshMessage, MessageKind, PathTag};
use crate::reputation::{BehaviorEvent, BehaviorMetric, ReputationEngine};
use crate::types::{PeerId, QosClass};

/// Weight of the average peer score in a route score.
const TRUST_WEIGHT: f64 = 0.7;
/// Weight of the length bonus `1/(len+1)`.
const LENGTH_WEIGHT: f64 = 0.3;

// ── Routes ────────────────────────────────────────────────────────────

/// Hops from the local node's next hop to the destination, inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Route(Vec<PeerId>);

impl Route {
    /// `None` for an empty hop list or one that visits a peer twice.
    pub fn new(hops: Vec<PeerId>) -> Option<Self> {
        if hops.is_empty() {
            return None;
        }
        let unique: HashSet<&PeerId> = hops.iter().collect();
        if unique.len() != hops.len() {
            return None;
        }
        Some(Self(hops))
    }

    pub fn direct(peer: PeerId) -> Self {
        Self(vec![peer])
    }

    pub fn first_hop(&self) -> &PeerId {
        &self.0[0]
    }

    pub fn destination(&self) -> &PeerId {
        &self.0[self.0.len() - 1]
    }

    pub fn hops(&self) -> &[PeerId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.0.contains(peer)
    }
}

/// Route table: direct neighbors plus learned multi-hop routes.
pub struct RouteTable {
    local_id: PeerId,
    neighbors: HashSet<PeerId>,
    learned: HashMap<PeerId, VecDeque<Route>>,
    last_good: HashMap<PeerId, Route>,
    per_destination: usize,
}

impl RouteTable {
    pub fn new(local_id: PeerId, per_destination: usize) -> Self {
        Self {
            local_id,
            neighbors: HashSet::new(),
            learned: HashMap::new(),
            last_good: HashMap::new(),
            per_destination: per_destination.max(1),
        }
    }

    pub fn add_neighbor(&mut self, peer: PeerId) -> bool {
        peer != self.local_id && self.neighbors.insert(peer)
    }

    /// The link is gone; routes through it stay learned but are not
    /// candidates until the link comes back.
    pub fn remove_neighbor(&mut self, peer: &PeerId) -> bool {
        self.neighbors.remove(peer)
    }

    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.neighbors.contains(peer)
    }

    /// Direct neighbors, sorted.
    pub fn neighbors(&self) -> Vec<PeerId> {
        let mut n: Vec<PeerId> = self.neighbors.iter().cloned().collect();
        n.sort();
        n
    }

    /// Remember a route. Newest routes are kept first; the oldest are
    /// dropped beyond the per-destination limit.
    pub fn learn_route(&mut self, hops: Vec<PeerId>) -> bool {
        let Some(route) = Route::new(hops) else {
            return false;
        };
        if route.contains(&self.local_id) {
            return false;
        }
        let limit = self.per_destination;
        let routes = self.learned.entry(route.destination().clone()).or_default();
        routes.retain(|r| r != &route);
        routes.push_front(route);
        routes.truncate(limit);
        true
    }

    /// Routes to `destination` whose first hop is a current neighbor.
    pub fn candidates(&self, destination: &PeerId) -> Vec<Route> {
        let mut out = Vec::new();
        if self.neighbors.contains(destination) {
            out.push(Route::direct(destination.clone()));
        }
        if let Some(routes) = self.learned.get(destination) {
            for route in routes {
                if self.neighbors.contains(route.first_hop()) && !out.contains(route) {
                    out.push(route.clone());
                }
            }
        }
        out
    }

    /// Forget a peer everywhere: as neighbor, as hop, as destination.
    pub fn purge_peer(&mut self, peer: &PeerId) -> usize {
        self.neighbors.remove(peer);
        let mut removed = 0;
        self.learned.retain(|dest, routes| {
            let before = routes.len();
            if dest == peer {
                removed += before;
                return false;
            }
            routes.retain(|r| !r.contains(peer));
            removed += before - routes.len();
            !routes.is_empty()
        });
        self.last_good.retain(|dest, r| dest != peer && !r.contains(peer));
        removed
    }

    /// Reset neighbors to `connected` and drop every route whose first hop
    /// is no longer one of them. Returns the number of routes dropped.
    pub fn recalculate(&mut self, connected: &[PeerId]) -> usize {
        self.neighbors = connected
            .iter()
            .filter(|p| **p != self.local_id)
            .cloned()
            .collect();
        let neighbors = &self.neighbors;
        let mut removed = 0;
        self.learned.retain(|_, routes| {
            let before = routes.len();
            routes.retain(|r| neighbors.contains(r.first_hop()));
            removed += before - routes.len();
            !routes.is_empty()
        });
        self.last_good.retain(|_, r| neighbors.contains(r.first_hop()));
        removed
    }

    pub fn mark_good(&mut self, route: &Route) {
        self.last_good
            .insert(route.destination().clone(), route.clone());
    }

    pub fn last_good(&self, destination: &PeerId) -> Option<&Route> {
        self.last_good.get(destination)
    }

    /// Destinations with at least one learned route.
    pub fn destinations(&self) -> Vec<PeerId> {
        let mut d: Vec<PeerId> = self.learned.keys().cloned().collect();
        d.sort();
        d
    }

    pub fn route_count(&self) -> usize {
        self.learned.values().map(VecDeque::len).sum()
    }
}

// ── Selection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRoute {
    pub route: Route,
    pub score: f64,
}

/// `0.7 · avg(peer scores) + 0.3 · 1/(len+1)`.
pub fn route_score(route: &Route, reputation: &ReputationEngine) -> f64 {
    let total: f64 = route
        .hops()
        .iter()
        .map(|p| reputation.score_or_neutral(p))
        .sum();
    let avg = total / route.len() as f64;
    TRUST_WEIGHT * avg + LENGTH_WEIGHT / (route.len() as f64 + 1.0)
}

/// Drop routes through blacklisted peers, score the rest and keep the best
/// `max_paths`. On equal score the `hint` route wins, then the shorter one.
pub fn select_routes(
    candidates: Vec<Route>,
    reputation: &ReputationEngine,
    blacklist_threshold: f64,
    max_paths: usize,
    hint: Option<&Route>,
) -> Vec<ScoredRoute> {
    let mut scored: Vec<ScoredRoute> = candidates
        .into_iter()
        .filter(|route| {
            let banned = route
                .hops()
                .iter()
                .find(|p| reputation.is_blacklisted(p, blacklist_threshold));
            if let Some(peer) = banned {
                tracing::debug!(%peer, "route skipped: blacklisted peer");
            }
            banned.is_none()
        })
        .map(|route| ScoredRoute {
            score: route_score(&route, reputation),
            route,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| (Some(&b.route) == hint).cmp(&(Some(&a.route) == hint)))
            .then_with(|| a.route.len().cmp(&b.route.len()))
            .then_with(|| a.route.hops().cmp(b.route.hops()))
    });
    scored.truncate(max_paths.max(1));
    scored
}

// ── Router ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RouterParams {
    pub blacklist_threshold: f64,
    pub max_paths: usize,
    pub default_ttl: u32,
    pub routes_per_destination: usize,
}

impl Default for RouterParams {
    fn default() -> Self {
        Self {
            blacklist_threshold: 0.10,
            max_paths: 3,
            default_ttl: crate::types::DEFAULT_TTL,
            routes_per_destination: 8,
        }
    }
}

/// Messages ready to go out, one per selected route.
#[derive(Debug, Clone)]
pub struct PathPlan {
    pub correlation_id: String,
    pub destination: PeerId,
    pub qos: QosClass,
    pub paths: Vec<(ScoredRoute, MeshMessage)>,
}

/// What happened on one path.
#[derive(Debug, Clone)]
pub struct PathOutcome {
    pub route: Route,
    pub score: f64,
    pub message_id: String,
    pub outcome: SendOutcome,
}

/// Result of a multi-path send.
#[derive(Debug, Clone)]
pub struct MultiPathReport {
    pub correlation_id: String,
    pub destination: PeerId,
    pub paths: Vec<PathOutcome>,
}

impl MultiPathReport {
    /// Number of paths whose first hop accepted the message.
    pub fn sent_paths(&self) -> usize {
        self.paths.iter().filter(|p| p.outcome.is_sent()).count()
    }

    pub fn any_sent(&self) -> bool {
        self.sent_paths() > 0
    }
}

pub struct MultiPathRouter {
    local_id: PeerId,
    table: Mutex<RouteTable>,
    reputation: Arc<ReputationEngine>,
    dispatcher: Arc<Dispatcher>,
    params: RouterParams,
}

impl MultiPathRouter {
    pub fn new(
        local_id: PeerId,
        params: RouterParams,
        reputation: Arc<ReputationEngine>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            table: Mutex::new(RouteTable::new(local_id.clone(), params.routes_per_destination)),
            local_id,
            reputation,
            dispatcher,
            params,
        }
    }

    pub fn add_neighbor(&self, peer: PeerId) -> bool {
        self.table.lock().add_neighbor(peer)
    }

    pub fn remove_neighbor(&self, peer: &PeerId) -> bool {
        self.table.lock().remove_neighbor(peer)
    }

    pub fn neighbors(&self) -> Vec<PeerId> {
        self.table.lock().neighbors()
    }

    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.table.lock().is_neighbor(peer)
    }

    pub fn learn_route(&self, hops: Vec<PeerId>) -> bool {
        self.table.lock().learn_route(hops)
    }

    pub fn purge_peer(&self, peer: &PeerId) -> usize {
        self.table.lock().purge_peer(peer)
    }

    pub fn recalculate(&self, connected: &[PeerId]) -> usize {
        let removed = self.table.lock().recalculate(connected);
        tracing::info!(removed, neighbors = connected.len(), "routes recalculated");
        removed
    }

    pub fn candidates(&self, destination: &PeerId) -> Vec<Route> {
        self.table.lock().candidates(destination)
    }

    pub fn route_count(&self) -> usize {
        self.table.lock().route_count()
    }

    /// Best routes to `destination`, at most `max_paths`.
    pub fn select(&self, destination: &PeerId, max_paths: usize) -> Vec<ScoredRoute> {
        let (candidates, hint) = {
            let table = self.table.lock();
            (
                table.candidates(destination),
                table.last_good(destination).cloned(),
            )
        };
        select_routes(
            candidates,
            &self.reputation,
            self.params.blacklist_threshold,
            max_paths,
            hint.as_ref(),
        )
    }

    /// Single best route, used to turn a flood relay into a directed one.
    pub fn best_route(&self, destination: &PeerId) -> Option<Route> {
        self.select(destination, 1).into_iter().next().map(|s| s.route)
    }

    /// Build one message per selected route without sending anything.
    pub fn plan(
        &self,
        destination: &PeerId,
        payload: Vec<u8>,
        qos: QosClass,
        max_paths: usize,
        kind: MessageKind,
    ) -> Result<PathPlan, MeshError> {
        let no_route = || MeshError::NoViableRoute {
            destination: destination.to_string(),
        };
        if destination == &self.local_id {
            return Err(no_route());
        }
        let selected = self.select(destination, max_paths);
        if selected.is_empty() {
            tracing::debug!(%destination, "no viable route");
            return Err(no_route());
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let total_paths = selected.len() as u16;
        let paths = selected
            .into_iter()
            .enumerate()
            .map(|(i, scored)| {
                // Each relay consumes one unit; the route must fit in the budget.
                let ttl = self.params.default_ttl.max(scored.route.len() as u32);
                let message = MeshMessage::new(
                    self.local_id.clone(),
                    destination.clone(),
                    ttl,
                    qos,
                    payload.clone(),
                )
                .with_kind(kind)
                .with_route(scored.route.hops().to_vec())
                .with_path_tag(PathTag {
                    correlation_id: correlation_id.clone(),
                    path_index: i as u16,
                    total_paths,
                });
                (scored, message)
            })
            .collect();

        Ok(PathPlan {
            correlation_id,
            destination: destination.clone(),
            qos,
            paths,
        })
    }

    /// Queue every path of `plan`, wait for all of them, then feed the
    /// outcomes back into the reputation engine.
    pub async fn execute(&self, plan: PathPlan) -> Result<MultiPathReport, MeshError> {
        let mut pending = Vec::with_capacity(plan.paths.len());
        for (scored, message) in plan.paths {
            let item = OutboundItem {
                payload: message.to_bytes()?,
                destination_id: scored.route.first_hop().clone(),
                qos_class: plan.qos,
                source_peer_id: self.local_id.clone(),
            };
            let receiver = match self.dispatcher.enqueue_tracked(item) {
                Ok((_, rx)) => Some(rx),
                Err(e) => {
                    tracing::warn!(route = ?scored.route, "path not queued: {e}");
                    None
                }
            };
            pending.push((scored, message.message_id, receiver));
        }

        let mut paths = Vec::with_capacity(pending.len());
        for (scored, message_id, receiver) in pending {
            let outcome = match receiver {
                Some(rx) => rx
                    .await
                    .unwrap_or(SendOutcome::Dropped(SendDropReason::Shutdown)),
                None => SendOutcome::Dropped(SendDropReason::QueueFull),
            };
            self.record_outcome(&scored.route, &outcome);
            paths.push(PathOutcome {
                route: scored.route,
                score: scored.score,
                message_id,
                outcome,
            });
        }

        let report = MultiPathReport {
            correlation_id: plan.correlation_id,
            destination: plan.destination,
            paths,
        };
        tracing::debug!(
            destination = %report.destination,
            sent = report.sent_paths(),
            total = report.paths.len(),
            "multi-path send finished"
        );
        Ok(report)
    }

    /// `plan` + `execute`.
    pub async fn send(
        &self,
        destination: &PeerId,
        payload: Vec<u8>,
        qos: QosClass,
        max_paths: usize,
    ) -> Result<MultiPathReport, MeshError> {
        let plan = self.plan(destination, payload, qos, max_paths, MessageKind::Data)?;
        self.execute(plan).await
    }

    fn record_outcome(&self, route: &Route, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Sent { .. } => {
                for peer in route.hops() {
                    self.reputation
                        .record_event(BehaviorEvent::new(peer.clone(), BehaviorMetric::RelaySuccess));
                }
                self.table.lock().mark_good(route);
            }
            // Only the first hop's link was exercised.
            SendOutcome::Dropped(SendDropReason::RetriesExhausted { .. }) => {
                self.reputation.record_event(BehaviorEvent::new(
                    route.first_hop().clone(),
                    BehaviorMetric::RelayFailure,
                ));
            }
            SendOutcome::Dropped(_) => {}
        }
    }
}
