//! Persistence sink contract and a SQLite-backed reference implementation.
//!
//! Keeps `ayourtch-netpoke`'s database shape (`Arc<tokio::sync::Mutex<Connection>>`,
//! schema loaded via `include_str!` and applied with `execute_batch`,
//! parameterized inserts via `rusqlite::params!`) and adds the bounded
//! exponential back-off retry this sink's failure semantics require that
//! the teacher's module didn't need.

use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::error::SinkError;
use crate::session::{AbortReason, SessionStatus, TraceSession};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Maximum write attempts (first try plus retries) before giving up and
    /// surfacing a health signal.
    pub retry_budget: u32,
    /// Base delay for the exponential back-off between write attempts.
    pub retry_base_delay: Duration,
    /// How far back reads are expected to reach; callers querying beyond
    /// this window still get an answer, just potentially empty.
    pub retention_window: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            retry_budget: 5,
            retry_base_delay: Duration::from_millis(100),
            retention_window: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanPoint {
    pub source: String,
    pub destination: IpAddr,
    pub path_signature: String,
    pub status: String,
    pub duration_ms: i64,
    pub hop_count: i64,
    pub completed: bool,
    pub error: Option<String>,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct PathPoint {
    pub source: String,
    pub destination: IpAddr,
    pub path_signature: String,
    pub path_json: String,
    pub known_hop_count: i64,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct HopPoint {
    pub source: String,
    pub destination: IpAddr,
    pub path_signature: String,
    pub hop_number: u8,
    pub hop_ip: Option<IpAddr>,
    pub is_destination: bool,
    pub mean_rtt_ms: Option<f64>,
    pub min_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    pub loss_percent: f64,
    pub sent: i64,
    pub received: i64,
    pub response_kinds_json: String,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct LatencyPoint {
    pub source: String,
    pub destination: IpAddr,
    pub hop_number: u8,
    pub hop_ip: Option<IpAddr>,
    pub sequence: u16,
    pub rtt_ms: Option<f64>,
    pub kind: String,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

/// Storage contract for completed Sessions. The core only depends on this
/// trait; the physical store is implementation-defined.
///
/// Write failures must never block Session completion — callers invoke
/// `write_session` but do not let its failure unwind or stall the worker
/// that produced the Session.
pub trait Sink: Send + Sync {
    fn write_session<'a>(
        &'a self,
        source: &'a str,
        session: &'a TraceSession,
        path_signature: &'a str,
        path: &'a [Option<IpAddr>],
    ) -> BoxFuture<'a, Result<(), SinkError>>;

    fn scans(&self, destination: IpAddr, window: Duration) -> BoxFuture<'_, Result<Vec<ScanPoint>, SinkError>>;
    fn paths(&self, destination: IpAddr, window: Duration) -> BoxFuture<'_, Result<Vec<PathPoint>, SinkError>>;
    fn hops(&self, destination: IpAddr, window: Duration) -> BoxFuture<'_, Result<Vec<HopPoint>, SinkError>>;
    fn latencies(&self, destination: IpAddr, hop_ip: Option<IpAddr>, window: Duration) -> BoxFuture<'_, Result<Vec<LatencyPoint>, SinkError>>;
}

fn status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Pending => "pending",
        SessionStatus::Running => "running",
        SessionStatus::Completed => "completed",
        SessionStatus::Aborted(AbortReason::TooManyUnknownHops) => "aborted_too_many_unknown_hops",
        SessionStatus::Aborted(AbortReason::TransportFatal) => "aborted_transport_fatal",
        SessionStatus::Aborted(AbortReason::Cancelled) => "aborted_cancelled",
        SessionStatus::Aborted(AbortReason::InvalidTarget) => "aborted_invalid_target",
    }
}

fn status_error(status: SessionStatus) -> Option<String> {
    match status {
        SessionStatus::Aborted(reason) => Some(format!("{reason:?}")),
        _ => None,
    }
}

/// SQLite-backed [`Sink`]. Matches the teacher's wrapping of a single
/// `Connection` in `Arc<tokio::sync::Mutex<_>>` rather than a pool, since
/// writes are already serialized by the Scheduler's worker-local callback
/// invocation and reads are infrequent relative to writes.
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
    config: SinkConfig,
}

impl SqliteSink {
    pub fn open(db_path: &Path, config: SinkConfig) -> Result<Self, SinkError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(include_str!("../migrations/001_topology_schema.sql"))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), config })
    }

    pub fn open_in_memory(config: SinkConfig) -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("../migrations/001_topology_schema.sql"))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), config })
    }

    async fn write_batch(&self, source: &str, session: &TraceSession, path_signature: &str, path: &[Option<IpAddr>]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let observed_at = session.ended_at().to_rfc3339();
        let destination = session.target().to_string();

        tx.execute(
            "INSERT INTO scan (source, destination, path_signature, status, duration_ms, hop_count, completed, error, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                source,
                destination,
                path_signature,
                status_label(session.status()),
                session.duration().as_millis() as i64,
                session.hops().len() as i64,
                matches!(session.status(), SessionStatus::Completed),
                status_error(session.status()),
                observed_at,
            ],
        )?;

        let path_json = serde_json::to_string(
            &path.iter().map(|a| a.map(|ip| ip.to_string())).collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());
        let known_hop_count = path.iter().filter(|h| h.is_some()).count() as i64;

        tx.execute(
            "INSERT INTO path (source, destination, path_signature, path_json, known_hop_count, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![source, destination, path_signature, path_json, known_hop_count, observed_at],
        )?;

        // Spread each successful probe's latency point across the session's
        // wall-clock window in proportion to its real relative ordering
        // (by `sent_at`), rather than stamping every point with the same
        // `observed_at` the scan/hop rows use.
        let all_sent_at: Vec<std::time::Instant> = session
            .hops()
            .values()
            .flat_map(|h| h.outcomes().map(|o| o.sent_at))
            .collect();
        let window_start = session.started_at();
        let window_span = (session.ended_at() - window_start).to_std().unwrap_or_default();
        let instant_min = all_sent_at.iter().min().copied();
        let instant_span = match (instant_min, all_sent_at.iter().max()) {
            (Some(min), Some(max)) => max.saturating_duration_since(min),
            _ => Duration::default(),
        };

        for (ttl, hop_stats) in session.hops() {
            let snapshot = hop_stats.snapshot();
            let hop_ip = snapshot.responders.first().map(|a| a.to_string());
            let is_destination = snapshot.responders.first() == Some(&session.target());
            let response_kinds_json =
                serde_json::to_string(&snapshot.response_kinds).unwrap_or_else(|_| "[]".to_string());

            tx.execute(
                "INSERT INTO hop (source, destination, path_signature, hop_number, hop_ip, is_destination,
                    mean_rtt_ms, min_rtt_ms, max_rtt_ms, loss_percent, sent, received, response_kinds_json, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    source,
                    destination,
                    path_signature,
                    *ttl as i64,
                    hop_ip,
                    is_destination,
                    snapshot.mean_rtt.map(|d| d.as_secs_f64() * 1000.0),
                    snapshot.best_rtt.map(|d| d.as_secs_f64() * 1000.0),
                    snapshot.worst_rtt.map(|d| d.as_secs_f64() * 1000.0),
                    snapshot.loss_percent,
                    snapshot.sent as i64,
                    (snapshot.sent - snapshot.lost) as i64,
                    response_kinds_json,
                    observed_at,
                ],
            )?;

            for outcome in hop_stats.outcomes() {
                if !outcome.kind.carries_rtt() {
                    continue;
                }

                let fraction = match instant_min {
                    Some(min) if !instant_span.is_zero() => {
                        outcome.sent_at.saturating_duration_since(min).as_secs_f64() / instant_span.as_secs_f64()
                    }
                    _ => 0.0,
                };
                let offset = window_span.mul_f64(fraction.clamp(0.0, 1.0));
                let latency_observed_at = (window_start + chrono::Duration::from_std(offset).unwrap_or_default()).to_rfc3339();

                tx.execute(
                    "INSERT INTO latency (source, destination, hop_number, hop_ip, sequence, rtt_ms, kind, observed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        source,
                        destination,
                        *ttl as i64,
                        outcome.responder.map(|a| a.to_string()),
                        outcome.sequence as i64,
                        outcome.rtt.map(|d| d.as_secs_f64() * 1000.0),
                        crate::hop_stats::outcome_kind_label(outcome.kind),
                        latency_observed_at,
                    ],
                )?;
            }
        }

        tx.commit()
    }

    async fn write_with_retry(&self, source: &str, session: &TraceSession, path_signature: &str, path: &[Option<IpAddr>]) -> Result<(), SinkError> {
        let mut attempt = 0u32;
        loop {
            match self.write_batch(source, session, path_signature, path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= self.config.retry_budget => {
                    tracing::error!("persistence write failed after {} attempts: {e}", attempt + 1);
                    return Err(SinkError::WriteFailed(e.to_string()));
                }
                Err(e) => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt);
                    tracing::warn!("persistence write attempt {} failed, retrying in {:?}: {e}", attempt + 1, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Sink for SqliteSink {
    fn write_session<'a>(
        &'a self,
        source: &'a str,
        session: &'a TraceSession,
        path_signature: &'a str,
        path: &'a [Option<IpAddr>],
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(self.write_with_retry(source, session, path_signature, path))
    }

    fn scans(&self, destination: IpAddr, window: Duration) -> BoxFuture<'_, Result<Vec<ScanPoint>, SinkError>> {
        let conn = self.conn.clone();
        Box::pin(async move {
            let cutoff = (chrono::Utc::now() - chrono::Duration::from_std(window).unwrap_or_default()).to_rfc3339();
            let dest = destination.to_string();
            let conn = conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT source, destination, path_signature, status, duration_ms, hop_count, completed, error, observed_at
                 FROM scan WHERE destination = ?1 AND observed_at >= ?2 ORDER BY observed_at ASC",
            )?;
            let rows = stmt
                .query_map(params![dest, cutoff], |row| {
                    Ok(ScanPoint {
                        source: row.get(0)?,
                        destination,
                        path_signature: row.get(2)?,
                        status: row.get(3)?,
                        duration_ms: row.get(4)?,
                        hop_count: row.get(5)?,
                        completed: row.get(6)?,
                        error: row.get(7)?,
                        observed_at: parse_rfc3339(row.get::<_, String>(8)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn paths(&self, destination: IpAddr, window: Duration) -> BoxFuture<'_, Result<Vec<PathPoint>, SinkError>> {
        let conn = self.conn.clone();
        Box::pin(async move {
            let cutoff = (chrono::Utc::now() - chrono::Duration::from_std(window).unwrap_or_default()).to_rfc3339();
            let dest = destination.to_string();
            let conn = conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT source, destination, path_signature, path_json, known_hop_count, observed_at
                 FROM path WHERE destination = ?1 AND observed_at >= ?2 ORDER BY observed_at ASC",
            )?;
            let rows = stmt
                .query_map(params![dest, cutoff], |row| {
                    Ok(PathPoint {
                        source: row.get(0)?,
                        destination,
                        path_signature: row.get(2)?,
                        path_json: row.get(3)?,
                        known_hop_count: row.get(4)?,
                        observed_at: parse_rfc3339(row.get::<_, String>(5)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn hops(&self, destination: IpAddr, window: Duration) -> BoxFuture<'_, Result<Vec<HopPoint>, SinkError>> {
        let conn = self.conn.clone();
        Box::pin(async move {
            let cutoff = (chrono::Utc::now() - chrono::Duration::from_std(window).unwrap_or_default()).to_rfc3339();
            let dest = destination.to_string();
            let conn = conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT source, destination, path_signature, hop_number, hop_ip, is_destination,
                    mean_rtt_ms, min_rtt_ms, max_rtt_ms, loss_percent, sent, received, response_kinds_json, observed_at
                 FROM hop WHERE destination = ?1 AND observed_at >= ?2 ORDER BY hop_number ASC, observed_at ASC",
            )?;
            let rows = stmt
                .query_map(params![dest, cutoff], |row| {
                    let hop_ip: Option<String> = row.get(4)?;
                    Ok(HopPoint {
                        source: row.get(0)?,
                        destination,
                        path_signature: row.get(2)?,
                        hop_number: row.get::<_, i64>(3)? as u8,
                        hop_ip: hop_ip.and_then(|s| s.parse().ok()),
                        is_destination: row.get(5)?,
                        mean_rtt_ms: row.get(6)?,
                        min_rtt_ms: row.get(7)?,
                        max_rtt_ms: row.get(8)?,
                        loss_percent: row.get(9)?,
                        sent: row.get(10)?,
                        received: row.get(11)?,
                        response_kinds_json: row.get(12)?,
                        observed_at: parse_rfc3339(row.get::<_, String>(13)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn latencies(&self, destination: IpAddr, hop_ip: Option<IpAddr>, window: Duration) -> BoxFuture<'_, Result<Vec<LatencyPoint>, SinkError>> {
        let conn = self.conn.clone();
        Box::pin(async move {
            let cutoff = (chrono::Utc::now() - chrono::Duration::from_std(window).unwrap_or_default()).to_rfc3339();
            let dest = destination.to_string();
            let hop_filter = hop_ip.map(|a| a.to_string());
            let conn = conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT source, destination, hop_number, hop_ip, sequence, rtt_ms, kind, observed_at
                 FROM latency WHERE destination = ?1 AND observed_at >= ?2
                    AND (?3 IS NULL OR hop_ip = ?3)
                 ORDER BY observed_at ASC",
            )?;
            let rows = stmt
                .query_map(params![dest, cutoff, hop_filter], |row| {
                    let hop_ip: Option<String> = row.get(3)?;
                    Ok(LatencyPoint {
                        source: row.get(0)?,
                        destination,
                        hop_number: row.get::<_, i64>(2)? as u8,
                        hop_ip: hop_ip.and_then(|s| s.parse().ok()),
                        sequence: row.get::<_, i64>(4)? as u16,
                        rtt_ms: row.get(5)?,
                        kind: row.get(6)?,
                        observed_at: parse_rfc3339(row.get::<_, String>(7)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn parse_rfc3339(s: String) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop_stats::HopStats;
    use crate::probe::{OutcomeKind, ProbeOutcome};
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn completed_session() -> TraceSession {
        let mut hops = BTreeMap::new();
        let mut hop1 = HopStats::with_default_ring(1);
        hop1.record(ProbeOutcome {
            responder: Some(IpAddr::from([10, 0, 0, 1])),
            rtt: Some(Duration::from_millis(5)),
            kind: OutcomeKind::EchoReply,
            ttl: 1,
            sequence: 0,
            sent_at: Instant::now(),
            received_at: Some(Instant::now()),
            fatal: false,
        });
        hops.insert(1, hop1);
        crate::session::test_support::build(IpAddr::from([198, 51, 100, 5]), hops, SessionStatus::Completed)
    }

    #[tokio::test]
    async fn write_then_read_back_scan_and_hop_rows() {
        let sink = SqliteSink::open_in_memory(SinkConfig::default()).unwrap();
        let session = completed_session();
        let path = vec![Some(IpAddr::from([10, 0, 0, 1]))];

        sink.write_session("local", &session, "10.0.0.1", &path).await.unwrap();

        let scans = sink.scans(session.target(), Duration::from_secs(3600)).await.unwrap();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].status, "completed");
        assert_eq!(scans[0].hop_count, 1);

        let hops = sink.hops(session.target(), Duration::from_secs(3600)).await.unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].hop_ip, Some(IpAddr::from([10, 0, 0, 1])));
        assert_eq!(hops[0].sent, 1);
    }

    #[tokio::test]
    async fn write_then_read_back_latency_point_per_successful_probe() {
        let sink = SqliteSink::open_in_memory(SinkConfig::default()).unwrap();
        let session = completed_session();
        let path = vec![Some(IpAddr::from([10, 0, 0, 1]))];

        sink.write_session("local", &session, "10.0.0.1", &path).await.unwrap();

        let latencies = sink.latencies(session.target(), None, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(latencies.len(), 1);
        assert_eq!(latencies[0].source, "local");
        assert_eq!(latencies[0].hop_number, 1);
        assert_eq!(latencies[0].hop_ip, Some(IpAddr::from([10, 0, 0, 1])));
        assert_eq!(latencies[0].sequence, 0);
        assert_eq!(latencies[0].rtt_ms, Some(5.0));
        assert_eq!(latencies[0].kind, "echo_reply");

        let filtered_out = sink
            .latencies(session.target(), Some(IpAddr::from([10, 0, 0, 2])), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(filtered_out.is_empty());
    }

    #[tokio::test]
    async fn query_for_unrelated_destination_returns_empty() {
        let sink = SqliteSink::open_in_memory(SinkConfig::default()).unwrap();
        let session = completed_session();
        let path = vec![Some(IpAddr::from([10, 0, 0, 1]))];
        sink.write_session("local", &session, "10.0.0.1", &path).await.unwrap();

        let other = IpAddr::from([203, 0, 113, 9]);
        let scans = sink.scans(other, Duration::from_secs(3600)).await.unwrap();
        assert!(scans.is_empty());
    }
}
