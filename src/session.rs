//! Per-target traceroute state machine.
//!
//! Keeps the round-based probing loop this module had under the teacher
//! (`session.rs`'s sequencing and sleeping-between-rounds style) and the
//! cancellation-friendly per-TTL structure from `kentik-netdiag`'s
//! `try_unfold`-based tracer, but the procedure itself is the
//! TTL-incrementing termination state machine: destination-reached,
//! too-many-unknown-hops, transport-fatal, or cancelled.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::hop_stats::{HopSnapshot, HopStats, DEFAULT_RING_SIZE};
use crate::probe::{OutcomeKind, ProbeSource};

/// Inputs governing one trace, with the defaults named in the system's
/// configuration surface (`mtr.*`).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub probes_per_hop: u32,
    pub probe_timeout: Duration,
    pub inter_probe_delay: Duration,
    pub inter_hop_delay: Duration,
    pub max_hops: u8,
    pub max_consecutive_unknown_hops: u32,
    pub ring_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            probes_per_hop: 3,
            probe_timeout: Duration::from_secs(1),
            inter_probe_delay: Duration::from_millis(100),
            inter_hop_delay: Duration::from_millis(50),
            max_hops: 30,
            max_consecutive_unknown_hops: 3,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

/// Why a session left the `running` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    TooManyUnknownHops,
    TransportFatal,
    Cancelled,
    InvalidTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Aborted(AbortReason),
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Pending | SessionStatus::Running)
    }
}

/// The frozen result of one trace to one target.
///
/// Once `status` leaves `running`, a `TraceSession` is immutable: readers
/// (the Aggregator, the Sink) only ever see it after `run` has returned.
#[derive(Debug, Clone)]
pub struct TraceSession {
    target: IpAddr,
    hops: BTreeMap<u8, HopStats>,
    status: SessionStatus,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl TraceSession {
    pub fn target(&self) -> IpAddr {
        self.target
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Build a terminal session with no recorded hops. Used by fake
    /// `SessionRunner`s in scheduler tests that need a `TraceSession`
    /// without driving real probes.
    pub fn stub(target: IpAddr, status: SessionStatus) -> Self {
        let now = Utc::now();
        Self {
            target,
            hops: BTreeMap::new(),
            status,
            started_at: now,
            ended_at: now,
        }
    }

    /// Sparse TTL → hop-stats map, grown as TTLs are probed.
    pub fn hops(&self) -> &BTreeMap<u8, HopStats> {
        &self.hops
    }

    /// Snapshots of every recorded hop in ascending TTL order.
    pub fn hop_snapshots(&self) -> Vec<HopSnapshot> {
        self.hops.values().map(HopStats::snapshot).collect()
    }

    /// Run the traceroute-plus-statistics procedure for `target` until a
    /// terminal condition is met, honoring `cancel` at every probe and
    /// sleep boundary.
    pub async fn run(
        target: IpAddr,
        options: SessionOptions,
        transport: Arc<dyn ProbeSource>,
        cancel: CancellationToken,
    ) -> TraceSession {
        let started_at = Utc::now();

        if !transport.supports(target) {
            return TraceSession {
                target,
                hops: BTreeMap::new(),
                status: SessionStatus::Aborted(AbortReason::InvalidTarget),
                started_at,
                ended_at: started_at,
            };
        }

        let mut hops: BTreeMap<u8, HopStats> = BTreeMap::new();
        let mut consecutive_unknown = 0u32;
        let mut status = SessionStatus::Running;

        'ttl: for ttl in 1..=options.max_hops {
            if cancel.is_cancelled() {
                status = SessionStatus::Aborted(AbortReason::Cancelled);
                break;
            }

            let hop_stats = hops
                .entry(ttl)
                .or_insert_with(|| HopStats::new(ttl, options.ring_size));

            let mut destination_reached = false;
            let mut all_loss = true;
            let mut fatal = false;

            for i in 0..options.probes_per_hop {
                if cancel.is_cancelled() {
                    status = SessionStatus::Aborted(AbortReason::Cancelled);
                    break 'ttl;
                }

                let outcome = transport.probe(target, ttl, options.probe_timeout, None).await;

                if !outcome.kind.is_loss() {
                    all_loss = false;
                }
                if outcome.kind == OutcomeKind::EchoReply && outcome.responder == Some(target) {
                    destination_reached = true;
                }
                if outcome.fatal {
                    fatal = true;
                }

                hop_stats.record(outcome);

                let is_last_probe = i + 1 == options.probes_per_hop;
                if !is_last_probe {
                    tokio::select! {
                        _ = tokio::time::sleep(options.inter_probe_delay) => {}
                        _ = cancel.cancelled() => {
                            status = SessionStatus::Aborted(AbortReason::Cancelled);
                            break 'ttl;
                        }
                    }
                }
            }

            if destination_reached {
                status = SessionStatus::Completed;
                break;
            }

            if all_loss {
                consecutive_unknown += 1;
            } else {
                consecutive_unknown = 0;
            }
            if consecutive_unknown >= options.max_consecutive_unknown_hops {
                status = SessionStatus::Aborted(AbortReason::TooManyUnknownHops);
                break;
            }

            if fatal {
                status = SessionStatus::Aborted(AbortReason::TransportFatal);
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(options.inter_hop_delay) => {}
                _ = cancel.cancelled() => {
                    status = SessionStatus::Aborted(AbortReason::Cancelled);
                    break 'ttl;
                }
            }
        }

        if status == SessionStatus::Running {
            status = SessionStatus::Completed;
        }

        TraceSession {
            target,
            hops,
            status,
            started_at,
            ended_at: Utc::now(),
        }
    }
}

/// Test-only escape hatch for building a `TraceSession` with caller-chosen
/// hops, used by other modules' tests (e.g. the topology aggregator) that
/// need a terminated session without driving `TraceSession::run`.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn build(target: IpAddr, hops: BTreeMap<u8, HopStats>, status: SessionStatus) -> TraceSession {
        let now = Utc::now();
        TraceSession { target, hops, status, started_at: now, ended_at: now }
    }
}
