//! End-to-end seed scenarios driving `TraceSession::run` through a scripted
//! `ProbeSource`, so these exercise the real state machine without a raw
//! socket. Mirrors scenario ids S1-S3, S6; S4 (path change) and S5
//! (scheduler concurrency) are covered in-module by `topology.rs` and
//! `scheduler.rs` respectively, where the fixtures they need already live.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mtr_topology_core::{AbortReason, OutcomeKind, ProbeOutcome, ProbeSource, SessionOptions, SessionStatus, TraceSession};
use tokio_util::sync::CancellationToken;

fn addr(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

/// One scripted reply to give back for a probe at a given TTL.
#[derive(Clone)]
struct ScriptedReply {
    kind: OutcomeKind,
    responder: Option<IpAddr>,
    rtt: Option<Duration>,
}

impl ScriptedReply {
    fn reply(responder: IpAddr, rtt_ms: u64) -> Self {
        Self { kind: OutcomeKind::EchoReply, responder: Some(responder), rtt: Some(Duration::from_millis(rtt_ms)) }
    }

    fn time_exceeded(responder: IpAddr, rtt_ms: u64) -> Self {
        Self { kind: OutcomeKind::TimeExceeded, responder: Some(responder), rtt: Some(Duration::from_millis(rtt_ms)) }
    }

    fn timeout() -> Self {
        Self { kind: OutcomeKind::Timeout, responder: None, rtt: None }
    }
}

/// Replays a fixed list of outcomes per TTL, one per `probe()` call at that
/// TTL (wrapping once exhausted). Optionally cancels the session's token
/// once a given TTL has been fully probed, to drive the cancellation
/// scenario deterministically instead of racing a real sleep.
struct FakeProbeSource {
    plan: HashMap<u8, Vec<ScriptedReply>>,
    calls: Mutex<HashMap<u8, usize>>,
    cancel_after_ttl: Option<(u8, CancellationToken)>,
}

impl FakeProbeSource {
    fn new(plan: HashMap<u8, Vec<ScriptedReply>>) -> Self {
        Self { plan, calls: Mutex::new(HashMap::new()), cancel_after_ttl: None }
    }

    fn cancelling_after(mut self, ttl: u8, cancel: CancellationToken) -> Self {
        self.cancel_after_ttl = Some((ttl, cancel));
        self
    }
}

impl ProbeSource for FakeProbeSource {
    fn supports(&self, _target: IpAddr) -> bool {
        true
    }

    fn probe(
        &self,
        _target: IpAddr,
        ttl: u8,
        _timeout: Duration,
        sequence_hint: Option<u16>,
    ) -> Pin<Box<dyn Future<Output = ProbeOutcome> + Send + '_>> {
        let replies = self.plan.get(&ttl).cloned().unwrap_or_else(|| vec![ScriptedReply::timeout()]);
        let mut calls = self.calls.lock().unwrap();
        let index = calls.entry(ttl).or_insert(0);
        let reply = replies[*index % replies.len()].clone();
        let is_last_for_hop = *index + 1 == replies.len();
        *index += 1;
        drop(calls);

        if is_last_for_hop {
            if let Some((cancel_ttl, cancel)) = &self.cancel_after_ttl {
                if *cancel_ttl == ttl {
                    cancel.cancel();
                }
            }
        }

        Box::pin(async move {
            ProbeOutcome {
                responder: reply.responder,
                rtt: reply.rtt,
                kind: reply.kind,
                ttl,
                sequence: sequence_hint.unwrap_or(0),
                sent_at: std::time::Instant::now(),
                received_at: reply.responder.map(|_| std::time::Instant::now()),
                fatal: false,
            }
        })
    }
}

fn fast_options(overrides: impl FnOnce(&mut SessionOptions)) -> SessionOptions {
    let mut opts = SessionOptions {
        probe_timeout: Duration::from_millis(20),
        inter_probe_delay: Duration::from_millis(1),
        inter_hop_delay: Duration::from_millis(1),
        ..SessionOptions::default()
    };
    overrides(&mut opts);
    opts
}

/// S1 - happy path, destination reached at hop 3.
#[tokio::test]
async fn s1_happy_path_destination_reached_at_hop_three() {
    let target = addr(198, 51, 100, 5);
    let plan = HashMap::from([
        (1, vec![ScriptedReply::time_exceeded(addr(10, 0, 0, 1), 1)]),
        (2, vec![ScriptedReply::time_exceeded(addr(10, 0, 0, 2), 2)]),
        (3, vec![ScriptedReply::reply(target, 10)]),
    ]);
    let transport: Arc<dyn ProbeSource> = Arc::new(FakeProbeSource::new(plan));

    let session = TraceSession::run(target, fast_options(|_| {}), transport, CancellationToken::new()).await;

    assert_eq!(session.status(), SessionStatus::Completed);
    assert_eq!(session.hops().len(), 3);
    for hop in session.hops().values() {
        assert_eq!(hop.snapshot().loss_percent, 0.0);
    }

    let signature: Vec<String> = session
        .hops()
        .values()
        .map(|h| h.first_responder().map(|a| a.to_string()).unwrap_or_else(|| "*".to_string()))
        .collect();
    assert_eq!(signature, vec!["10.0.0.1", "10.0.0.2", "198.51.100.5"]);
}

/// S2 - partial loss and unknown hop.
#[tokio::test]
async fn s2_partial_loss_and_unknown_hop() {
    let target = addr(198, 51, 100, 5);
    let plan = HashMap::from([
        (1, vec![ScriptedReply::reply(addr(10, 0, 0, 1), 1)]),
        (
            2,
            vec![
                ScriptedReply::reply(addr(10, 0, 0, 2), 5),
                ScriptedReply::timeout(),
                ScriptedReply::timeout(),
            ],
        ),
        (3, vec![ScriptedReply::reply(target, 10)]),
    ]);
    let transport: Arc<dyn ProbeSource> = Arc::new(FakeProbeSource::new(plan));

    let session = TraceSession::run(target, fast_options(|_| {}), transport, CancellationToken::new()).await;

    assert_eq!(session.status(), SessionStatus::Completed);
    let hop2 = session.hops().get(&2).expect("hop 2 recorded").snapshot();
    assert_eq!(hop2.sent, 3);
    assert_eq!(hop2.lost, 2);
    assert!((hop2.loss_percent - 66.666).abs() < 0.1);
    assert_eq!(hop2.mean_rtt, Some(Duration::from_millis(5)));
}

/// S3 - early termination on consecutive unknowns.
#[tokio::test]
async fn s3_early_termination_on_consecutive_unknowns() {
    let target = addr(198, 51, 100, 5);
    let plan = HashMap::from([(1, vec![ScriptedReply::reply(addr(10, 0, 0, 1), 1)])]);
    let transport: Arc<dyn ProbeSource> = Arc::new(FakeProbeSource::new(plan));

    let options = fast_options(|o| o.max_consecutive_unknown_hops = 3);
    let session = TraceSession::run(target, options, transport, CancellationToken::new()).await;

    assert_eq!(session.status(), SessionStatus::Aborted(AbortReason::TooManyUnknownHops));
    assert_eq!(session.hops().len(), 4);
    let signature: Vec<Option<IpAddr>> = session.hops().values().map(|h| h.first_responder()).collect();
    assert_eq!(signature, vec![Some(addr(10, 0, 0, 1)), None, None, None]);
}

/// S6 - cancellation mid-trace.
#[tokio::test]
async fn s6_cancellation_after_observing_hop_five() {
    let target = addr(198, 51, 100, 5);
    let cancel = CancellationToken::new();

    let mut plan = HashMap::new();
    for ttl in 1..=10u8 {
        plan.insert(ttl, vec![ScriptedReply::time_exceeded(addr(10, 0, 0, ttl), ttl as u64)]);
    }
    let source = FakeProbeSource::new(plan).cancelling_after(5, cancel.clone());
    let transport: Arc<dyn ProbeSource> = Arc::new(source);

    let options = fast_options(|o| {
        o.max_hops = 30;
        o.probes_per_hop = 1;
        o.inter_hop_delay = Duration::from_millis(5);
    });

    let start = std::time::Instant::now();
    let session = TraceSession::run(target, options, transport, cancel).await;
    let elapsed = start.elapsed();

    assert_eq!(session.status(), SessionStatus::Aborted(AbortReason::Cancelled));
    assert!(session.hops().len() <= 6, "expected at most hops 1..=6, got {}", session.hops().len());
    assert!(!session.hops().contains_key(&7));
    assert!(elapsed < Duration::from_millis(500));
}
