//! Topology graph built incrementally from completed traces, with
//! path-change detection against the last-known path per target.
//!
//! The graph itself follows `petgraph`'s directed-graphmap shape (nodes are
//! their own keys, no separate index bookkeeping) the way `trippy-core`
//! pulls in `petgraph` for its own hop graph; the aggregation/merge and
//! path-signature rules are this module's own.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use parking_lot::Mutex;
use petgraph::graphmap::DiGraphMap;

use crate::hop_stats::HopSnapshot;
use crate::session::{SessionStatus, TraceSession};

/// Token standing in for a TTL whose responder was never observed. Chosen to
/// sort before any dotted-decimal or colon-hex address so unknown positions
/// are visually distinct in a rendered signature.
const UNKNOWN_HOP_TOKEN: &str = "*";

/// A node in the [`TopologyGraph`]. Keyed by `(kind, address)`, so the same
/// address can appear as both a `Router` (an intermediate hop on the way to
/// some other target) and a `Destination` (the terminus of its own trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    /// The single sampling vantage point this Aggregator runs from.
    Source,
    Router(IpAddr),
    Destination(IpAddr),
}

/// Aggregated metrics for one directed edge, merged across every session
/// whose path traversed it.
#[derive(Debug, Clone)]
pub struct LinkStats {
    pub mean_rtt: Option<Duration>,
    pub mean_loss: f64,
    pub sample_count: u64,
    pub destinations: IndexSet<IpAddr>,
    pub last_observed_at: DateTime<Utc>,
}

impl LinkStats {
    fn new(observed_rtt: Option<Duration>, observed_loss: f64, destination: IpAddr, at: DateTime<Utc>) -> Self {
        let mut destinations = IndexSet::new();
        destinations.insert(destination);
        Self {
            mean_rtt: observed_rtt,
            mean_loss: observed_loss,
            sample_count: 1,
            destinations,
            last_observed_at: at,
        }
    }

    /// `new_mean = (prev_mean * prev_count + observed) / (prev_count + 1)`
    /// until `sample_count` saturates `ema_sample_cap`; thereafter the merge
    /// switches to a fixed-smoothing EMA so old samples decay instead of
    /// diluting forever.
    fn merge(&mut self, observed_rtt: Option<Duration>, observed_loss: f64, destination: IpAddr, at: DateTime<Utc>, ema_sample_cap: u64, ema_alpha: f64) {
        self.destinations.insert(destination);
        self.last_observed_at = at;

        if self.sample_count >= ema_sample_cap {
            self.mean_loss = ema_alpha * observed_loss + (1.0 - ema_alpha) * self.mean_loss;
            self.mean_rtt = match (self.mean_rtt, observed_rtt) {
                (Some(prev), Some(obs)) => {
                    let blended = ema_alpha * obs.as_secs_f64() + (1.0 - ema_alpha) * prev.as_secs_f64();
                    Some(Duration::from_secs_f64(blended.max(0.0)))
                }
                (prev, None) => prev,
                (None, Some(obs)) => Some(obs),
            };
            return;
        }

        let n = self.sample_count as f64;
        self.mean_loss = (self.mean_loss * n + observed_loss) / (n + 1.0);
        self.mean_rtt = match (self.mean_rtt, observed_rtt) {
            (Some(prev), Some(obs)) => {
                let blended = (prev.as_secs_f64() * n + obs.as_secs_f64()) / (n + 1.0);
                Some(Duration::from_secs_f64(blended))
            }
            (prev, None) => prev,
            (None, Some(obs)) => Some(obs),
        };
        self.sample_count += 1;
    }
}

pub type TopologyGraph = DiGraphMap<NodeId, LinkStats>;

/// A path-change notification: the signature recorded for `target` changed.
#[derive(Debug, Clone)]
pub struct PathChangeEvent {
    pub target: IpAddr,
    pub old_signature: String,
    pub new_signature: String,
    pub old_path: Vec<Option<IpAddr>>,
    pub new_path: Vec<Option<IpAddr>>,
    pub observed_at: DateTime<Utc>,
    pub previous_duration: Duration,
}

/// One dated observation of a hop's aggregated latency/loss, kept for the
/// `hop_stats` time-series query.
#[derive(Debug, Clone)]
pub struct HopSample {
    pub observed_at: DateTime<Utc>,
    pub mean_rtt: Option<Duration>,
    pub loss_percent: f64,
}

#[derive(Debug, Clone)]
pub struct CurrentPath {
    pub target: IpAddr,
    pub observed_at: DateTime<Utc>,
    pub path: Vec<Option<IpAddr>>,
}

#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    /// `sample_count` ceiling at which link merging switches from a running
    /// mean to an exponential moving average.
    pub ema_sample_cap: u64,
    /// Smoothing factor used once a link has crossed `ema_sample_cap`.
    pub ema_alpha: f64,
    /// Bounds the in-memory path-change log; the Sink is the source of
    /// truth for anything older.
    pub change_log_capacity: usize,
    /// Bounds the in-memory per-hop sample series, same rationale.
    pub hop_series_capacity: usize,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            ema_sample_cap: 64,
            ema_alpha: 0.2,
            change_log_capacity: 1024,
            hop_series_capacity: 256,
        }
    }
}

struct TargetRecord {
    signature: String,
    path: Vec<Option<IpAddr>>,
    since: DateTime<Utc>,
    last_ended_at: DateTime<Utc>,
}

struct Inner {
    graph: TopologyGraph,
    targets: HashMap<IpAddr, TargetRecord>,
    change_log: VecDeque<PathChangeEvent>,
    hop_series: HashMap<(IpAddr, IpAddr), VecDeque<HopSample>>,
}

/// Turns a stream of completed [`TraceSession`]s into a queryable topology
/// and detects path changes.
///
/// Multi-writer (one ingest per completed Session), arbitrated by a single
/// mutex around the graph, target-record table and change log; queries take
/// a lock-scoped consistent snapshot rather than iterating a live graph.
pub struct TopologyAggregator {
    options: AggregatorOptions,
    inner: Mutex<Inner>,
}

impl TopologyAggregator {
    pub fn new(options: AggregatorOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner {
                graph: TopologyGraph::new(),
                targets: HashMap::new(),
                change_log: VecDeque::new(),
                hop_series: HashMap::new(),
            }),
        }
    }

    /// Compute the deterministic signature and parallel path for a
    /// terminated session: the first responder of each TTL in ascending
    /// order, unknowns rendered as `*`. Pure function of `hops`; equal
    /// first-responder sequences always yield equal signatures.
    pub fn path_signature(session: &TraceSession) -> (String, Vec<Option<IpAddr>>) {
        let hops = session.hops();
        let Some(&max_ttl) = hops.keys().max() else {
            return (String::new(), Vec::new());
        };

        let mut tokens = Vec::with_capacity(max_ttl as usize);
        let mut path = Vec::with_capacity(max_ttl as usize);
        for ttl in 1..=max_ttl {
            match hops.get(&ttl).and_then(|h| h.first_responder()) {
                Some(addr) => {
                    tokens.push(addr.to_string());
                    path.push(Some(addr));
                }
                None => {
                    tokens.push(UNKNOWN_HOP_TOKEN.to_string());
                    path.push(None);
                }
            }
        }
        (tokens.join("|"), path)
    }

    /// Ingest one completed Session: update the topology graph and return a
    /// [`PathChangeEvent`] if its path signature differs from the last one
    /// recorded for this target.
    pub fn ingest(&self, session: &TraceSession) -> Option<PathChangeEvent> {
        let (signature, path) = Self::path_signature(session);
        let now = session.ended_at();

        let mut inner = self.inner.lock();
        self.update_graph(&mut inner, session, &path);

        let event = match inner.targets.get(&session.target()) {
            None => None,
            Some(existing) if now <= existing.last_ended_at => {
                // Stale/out-of-order arrival; the graph link merge above
                // already happened (harmless even if reordered), but the
                // "current" signature must not regress.
                return None;
            }
            Some(existing) if existing.signature == signature => None,
            Some(existing) => Some(PathChangeEvent {
                target: session.target(),
                old_signature: existing.signature.clone(),
                new_signature: signature.clone(),
                old_path: existing.path.clone(),
                new_path: path.clone(),
                observed_at: now,
                previous_duration: (now - existing.since).to_std().unwrap_or_default(),
            }),
        };

        let since = match (&event, inner.targets.get(&session.target())) {
            (Some(_), _) => now,
            (None, Some(existing)) => existing.since,
            (None, None) => now,
        };

        inner.targets.insert(
            session.target(),
            TargetRecord { signature, path, since, last_ended_at: now },
        );

        if let Some(ref ev) = event {
            if inner.change_log.len() >= self.options.change_log_capacity {
                inner.change_log.pop_front();
            }
            inner.change_log.push_back(ev.clone());
        }

        event
    }

    fn update_graph(&self, inner: &mut Inner, session: &TraceSession, path: &[Option<IpAddr>]) {
        let target = session.target();
        inner.graph.add_node(NodeId::Source);
        inner.graph.add_node(NodeId::Destination(target));

        let destination_reached = session.status() == SessionStatus::Completed
            && path.last().copied().flatten() == Some(target);

        // One slot per position (Source, then each TTL in `path`); `None`
        // marks an unresponsive TTL. The final known position is folded into
        // the Destination node (by address identity) only when the trace
        // actually reached `target`, so an aborted trace's last-seen router
        // still shows as a Router, not a phantom Destination.
        let mut positions: Vec<Option<NodeId>> = Vec::with_capacity(path.len() + 1);
        positions.push(Some(NodeId::Source));
        for (i, hop) in path.iter().enumerate() {
            let node = hop.map(|addr| {
                let is_final = i + 1 == path.len();
                if is_final && destination_reached && addr == target {
                    NodeId::Destination(target)
                } else {
                    NodeId::Router(addr)
                }
            });
            if let Some(node) = node {
                inner.graph.add_node(node);
            }
            positions.push(node);
        }

        let now = session.ended_at();
        for hop_stats in session.hops().values() {
            let snapshot = hop_stats.snapshot();
            let Some(addr) = snapshot.responders.first().copied() else { continue };
            self.record_hop_sample(inner, target, addr, &snapshot, now);
        }

        // A link exists only between responders at numerically consecutive
        // TTLs; an unresponsive hop between two known ones breaks the chain
        // rather than being bridged over.
        for window in positions.windows(2) {
            let (Some(from), Some(to)) = (window[0], window[1]) else { continue };
            let (rtt, loss) = link_observation_for(session, to);
            match inner.graph.edge_weight_mut(from, to) {
                Some(stats) => stats.merge(rtt, loss, target, now, self.options.ema_sample_cap, self.options.ema_alpha),
                None => {
                    inner.graph.add_edge(from, to, LinkStats::new(rtt, loss, target, now));
                }
            }
        }
    }

    fn record_hop_sample(&self, inner: &mut Inner, target: IpAddr, hop_addr: IpAddr, snapshot: &HopSnapshot, at: DateTime<Utc>) {
        let series = inner.hop_series.entry((target, hop_addr)).or_default();
        if series.len() >= self.options.hop_series_capacity {
            series.pop_front();
        }
        series.push_back(HopSample {
            observed_at: at,
            mean_rtt: snapshot.mean_rtt,
            loss_percent: snapshot.loss_percent,
        });
    }

    /// Subgraph whose links have at least one sample inside `window`
    /// (measured back from now), optionally restricted to links serving
    /// `filter` as a destination.
    pub fn topology(&self, window: Duration, filter: Option<IpAddr>) -> Vec<(NodeId, NodeId, LinkStats)> {
        let inner = self.inner.lock();
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        inner
            .graph
            .all_edges()
            .filter(|(_, _, stats)| stats.last_observed_at >= cutoff)
            .filter(|(_, _, stats)| filter.map_or(true, |f| stats.destinations.contains(&f)))
            .map(|(from, to, stats)| (from, to, stats.clone()))
            .collect()
    }

    /// Time series of per-session aggregates for one `(target, hop_address)`
    /// pair within `window`.
    pub fn hop_stats(&self, target: IpAddr, hop_address: IpAddr, window: Duration) -> Vec<HopSample> {
        let inner = self.inner.lock();
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        inner
            .hop_series
            .get(&(target, hop_address))
            .map(|series| series.iter().filter(|s| s.observed_at >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Path-change events recorded within `window`, oldest first.
    pub fn path_changes(&self, target: Option<IpAddr>, window: Duration) -> Vec<PathChangeEvent> {
        let inner = self.inner.lock();
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        inner
            .change_log
            .iter()
            .filter(|e| e.observed_at >= cutoff)
            .filter(|e| target.map_or(true, |t| e.target == t))
            .cloned()
            .collect()
    }

    /// The most recently observed path for every known target.
    pub fn current_paths(&self) -> Vec<CurrentPath> {
        let inner = self.inner.lock();
        inner
            .targets
            .iter()
            .map(|(target, record)| CurrentPath {
                target: *target,
                observed_at: record.last_ended_at,
                path: record.path.clone(),
            })
            .collect()
    }
}

/// `link_observation_for` reads the HopStats that landed `to` to produce the
/// single-session rtt/loss sample this edge should be merged with. `Source`
/// has no owning HopStats (it precedes TTL 1), so it contributes no
/// observation beyond the edge's existence.
fn link_observation_for(session: &TraceSession, to: NodeId) -> (Option<Duration>, f64) {
    let addr = match to {
        NodeId::Router(a) | NodeId::Destination(a) => a,
        NodeId::Source => return (None, 0.0),
    };
    for hop in session.hops().values() {
        if hop.first_responder() == Some(addr) {
            let snap = hop.snapshot();
            return (snap.mean_rtt, snap.loss_percent);
        }
    }
    (None, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop_stats::HopStats;
    use crate::probe::{OutcomeKind, ProbeOutcome};
    use crate::session::AbortReason;
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn replying_hop(ttl: u8, addr: IpAddr, rtt_ms: u64) -> HopStats {
        let mut hop = HopStats::with_default_ring(ttl);
        hop.record(ProbeOutcome {
            responder: Some(addr),
            rtt: Some(Duration::from_millis(rtt_ms)),
            kind: OutcomeKind::EchoReply,
            ttl,
            sequence: 0,
            sent_at: Instant::now(),
            received_at: Some(Instant::now()),
            fatal: false,
        });
        hop
    }

    fn unknown_hop(ttl: u8) -> HopStats {
        let mut hop = HopStats::with_default_ring(ttl);
        hop.record(ProbeOutcome {
            responder: None,
            rtt: None,
            kind: OutcomeKind::Timeout,
            ttl,
            sequence: 0,
            sent_at: Instant::now(),
            received_at: None,
            fatal: false,
        });
        hop
    }

    fn session_from(target: IpAddr, hops: BTreeMap<u8, HopStats>, status: SessionStatus) -> TraceSession {
        crate::session::test_support::build(target, hops, status)
    }

    fn addr4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::from([a, b, c, d])
    }

    #[test]
    fn signature_matches_s1_happy_path() {
        let mut hops = BTreeMap::new();
        hops.insert(1, replying_hop(1, addr4(10, 0, 0, 1), 1));
        hops.insert(2, replying_hop(2, addr4(10, 0, 0, 2), 2));
        hops.insert(3, replying_hop(3, addr4(198, 51, 100, 5), 10));
        let session = session_from(addr4(198, 51, 100, 5), hops, SessionStatus::Completed);

        let (sig, _) = TopologyAggregator::path_signature(&session);
        assert_eq!(sig, "10.0.0.1|10.0.0.2|198.51.100.5");
    }

    #[test]
    fn signature_matches_s3_unknown_tokens() {
        let mut hops = BTreeMap::new();
        hops.insert(1, replying_hop(1, addr4(10, 0, 0, 1), 1));
        hops.insert(2, unknown_hop(2));
        hops.insert(3, unknown_hop(3));
        hops.insert(4, unknown_hop(4));
        let session = session_from(
            addr4(198, 51, 100, 5),
            hops,
            SessionStatus::Aborted(AbortReason::TooManyUnknownHops),
        );

        let (sig, path) = TopologyAggregator::path_signature(&session);
        assert_eq!(sig, "10.0.0.1|*|*|*");
        assert_eq!(path[1], None);
    }

    #[test]
    fn first_ingest_of_a_target_emits_no_event() {
        let agg = TopologyAggregator::new(AggregatorOptions::default());
        let mut hops = BTreeMap::new();
        hops.insert(1, replying_hop(1, addr4(10, 0, 0, 1), 1));
        let session = session_from(addr4(198, 51, 100, 5), hops, SessionStatus::Completed);

        assert!(agg.ingest(&session).is_none());
    }

    #[test]
    fn differing_signature_emits_exactly_one_path_change_event() {
        let agg = TopologyAggregator::new(AggregatorOptions::default());
        let target = addr4(198, 51, 100, 5);

        let mut first = BTreeMap::new();
        first.insert(1, replying_hop(1, addr4(10, 0, 0, 1), 1));
        first.insert(2, replying_hop(2, addr4(10, 0, 0, 2), 2));
        assert!(agg.ingest(&session_from(target, first, SessionStatus::Completed)).is_none());

        let mut second = BTreeMap::new();
        second.insert(1, replying_hop(1, addr4(10, 0, 0, 1), 1));
        second.insert(2, replying_hop(2, addr4(10, 0, 0, 3), 2));
        let event = agg
            .ingest(&session_from(target, second, SessionStatus::Completed))
            .expect("signature changed, event expected");

        assert_eq!(event.old_signature, "10.0.0.1|10.0.0.2");
        assert_eq!(event.new_signature, "10.0.0.1|10.0.0.3");
        assert_eq!(event.target, target);
    }

    #[test]
    fn equal_signature_updates_last_seen_without_event() {
        let agg = TopologyAggregator::new(AggregatorOptions::default());
        let target = addr4(198, 51, 100, 5);
        let build = || {
            let mut hops = BTreeMap::new();
            hops.insert(1, replying_hop(1, addr4(10, 0, 0, 1), 1));
            session_from(target, hops, SessionStatus::Completed)
        };

        assert!(agg.ingest(&build()).is_none());
        assert!(agg.ingest(&build()).is_none());

        let paths = agg.current_paths();
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn every_link_endpoint_exists_as_a_node_and_sample_count_is_positive() {
        let agg = TopologyAggregator::new(AggregatorOptions::default());
        let mut hops = BTreeMap::new();
        hops.insert(1, replying_hop(1, addr4(10, 0, 0, 1), 5));
        hops.insert(2, replying_hop(2, addr4(198, 51, 100, 5), 10));
        let session = session_from(addr4(198, 51, 100, 5), hops, SessionStatus::Completed);
        agg.ingest(&session);

        let links = agg.topology(Duration::from_secs(3600), None);
        assert!(!links.is_empty());
        for (from, to, stats) in &links {
            assert!(agg.inner.lock().graph.contains_node(*from));
            assert!(agg.inner.lock().graph.contains_node(*to));
            assert!(stats.sample_count >= 1);
            assert!(stats.mean_loss >= 0.0 && stats.mean_loss <= 100.0);
        }
    }

    #[test]
    fn unresponsive_hop_does_not_bridge_a_link_over_the_gap() {
        let agg = TopologyAggregator::new(AggregatorOptions::default());
        let target = addr4(198, 51, 100, 5);
        let a = addr4(10, 0, 0, 1);
        let b = addr4(10, 0, 0, 2);

        let mut hops = BTreeMap::new();
        hops.insert(1, replying_hop(1, a, 1));
        hops.insert(2, unknown_hop(2));
        hops.insert(3, replying_hop(3, b, 3));
        let session = session_from(target, hops, SessionStatus::Aborted(AbortReason::TooManyUnknownHops));
        agg.ingest(&session);

        let links = agg.topology(Duration::from_secs(3600), None);
        let pairs: Vec<(NodeId, NodeId)> = links.iter().map(|(from, to, _)| (*from, *to)).collect();

        assert!(pairs.contains(&(NodeId::Source, NodeId::Router(a))));
        assert!(!pairs.contains(&(NodeId::Router(a), NodeId::Router(b))));
        assert!(!pairs.iter().any(|(_, to)| *to == NodeId::Router(b)));
    }
}
