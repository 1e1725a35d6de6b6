//! Bounded per-(target, ttl) history of probe outcomes and the summary
//! metrics derived from it.
//!
//! Keeps the ring-buffer-plus-derived-metrics shape this module had under
//! the teacher (`VecDeque`, capped append, recomputed-on-read stats) but the
//! metric rules themselves follow the strict loss definition: only
//! `timeout`/`send_error` count as loss, and `mean_rtt` is taken over
//! successful probes only.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use indexmap::IndexSet;

use crate::probe::{OutcomeKind, ProbeOutcome};

/// Default ring length; overridden by `aggregator.ring_size`.
pub const DEFAULT_RING_SIZE: usize = 10;

/// Immutable, derived view of a [`HopStats`] at a point in time.
///
/// Readers only ever see a `HopSnapshot`; it is produced under the same
/// short critical section that guards the owning `HopStats`, so partial
/// updates are never observable.
#[derive(Debug, Clone, PartialEq)]
pub struct HopSnapshot {
    pub ttl: u8,
    pub responders: Vec<IpAddr>,
    pub sent: u64,
    pub lost: u64,
    pub loss_percent: f64,
    pub last_rtt: Option<Duration>,
    pub best_rtt: Option<Duration>,
    pub worst_rtt: Option<Duration>,
    pub mean_rtt: Option<Duration>,
    /// Raw outcome kinds currently held in the ring, oldest first; feeds the
    /// `response_kinds_json` field of the `hop` persistence point.
    pub response_kinds: Vec<&'static str>,
}

/// A bounded history of `ProbeOutcome`s for one `(target, ttl)` pair.
///
/// Single-writer (the owning `TraceSession`), snapshot-on-read for
/// everyone else.
#[derive(Debug, Clone)]
pub struct HopStats {
    ttl: u8,
    ring_capacity: usize,
    ring: VecDeque<ProbeOutcome>,
    responders: IndexSet<IpAddr>,
    sent: u64,
    lost: u64,
}

impl HopStats {
    pub fn new(ttl: u8, ring_capacity: usize) -> Self {
        Self {
            ttl,
            ring_capacity: ring_capacity.max(1),
            ring: VecDeque::with_capacity(ring_capacity.max(1)),
            responders: IndexSet::new(),
            sent: 0,
            lost: 0,
        }
    }

    pub fn with_default_ring(ttl: u8) -> Self {
        Self::new(ttl, DEFAULT_RING_SIZE)
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Append `outcome`, evicting the oldest entry once the ring is full.
    pub fn record(&mut self, outcome: ProbeOutcome) {
        self.sent += 1;
        if outcome.kind.is_loss() {
            self.lost += 1;
        }
        if let Some(responder) = outcome.responder {
            self.responders.insert(responder);
        }

        if self.ring.len() >= self.ring_capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(outcome);
    }

    pub fn is_empty(&self) -> bool {
        self.sent == 0
    }

    /// First-seen-order distinct responders observed at this TTL.
    pub fn first_responder(&self) -> Option<IpAddr> {
        self.responders.first().copied()
    }

    pub fn responders(&self) -> impl Iterator<Item = &IpAddr> {
        self.responders.iter()
    }

    /// Raw outcomes currently held in the ring, oldest first. Used by the
    /// persistence sink to emit one `latency` point per successful probe.
    pub fn outcomes(&self) -> impl Iterator<Item = &ProbeOutcome> {
        self.ring.iter()
    }

    /// Produce an immutable, fully-derived view. Metrics are commutative
    /// over the outcome multiset, so the order outcomes were recorded in
    /// never affects the result.
    pub fn snapshot(&self) -> HopSnapshot {
        let loss_percent = if self.sent > 0 {
            100.0 * self.lost as f64 / self.sent as f64
        } else {
            0.0
        };

        let successes: Vec<Duration> = self
            .ring
            .iter()
            .filter(|o| o.kind.carries_rtt())
            .filter_map(|o| o.rtt)
            .collect();

        let last_rtt = self
            .ring
            .iter()
            .rev()
            .find(|o| o.kind.carries_rtt())
            .and_then(|o| o.rtt);

        let best_rtt = successes.iter().min().copied();
        let worst_rtt = successes.iter().max().copied();
        let mean_rtt = if successes.is_empty() {
            None
        } else {
            let sum: Duration = successes.iter().sum();
            Some(sum / successes.len() as u32)
        };

        HopSnapshot {
            ttl: self.ttl,
            responders: self.responders.iter().copied().collect(),
            sent: self.sent,
            lost: self.lost,
            loss_percent,
            last_rtt,
            best_rtt,
            worst_rtt,
            mean_rtt,
            response_kinds: self.ring.iter().map(|o| outcome_kind_label(o.kind)).collect(),
        }
    }
}

pub(crate) fn outcome_kind_label(kind: OutcomeKind) -> &'static str {
    match kind {
        OutcomeKind::EchoReply => "echo_reply",
        OutcomeKind::TimeExceeded => "time_exceeded",
        OutcomeKind::Unreachable => "unreachable",
        OutcomeKind::OtherIcmp(_) => "other_icmp",
        OutcomeKind::Timeout => "timeout",
        OutcomeKind::SendError => "send_error",
    }
}
