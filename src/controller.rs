//! Wires the Transport, Scheduler, Aggregator and Sink together and drives
//! the periodic scan loop.
//!
//! The lifecycle shape (`init` constructs, `start` spawns the owning loop,
//! `stop` signals and joins) follows the teacher's service-entry-point
//! pattern; the periodic-scan/back-off behavior is grounded in
//! `original_source/core/mtr.py`'s `MTRRunner.run` scan cycle.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::ControllerError;
use crate::persistence::{Sink, SqliteSink};
use crate::probe::Transport;
use crate::scheduler::Scheduler;
use crate::session::{SessionOptions, TraceSession};
use crate::topology::{CurrentPath, HopSample, LinkStats, NodeId, PathChangeEvent, TopologyAggregator};

/// A target the periodic scanner knows about.
#[derive(Debug, Clone)]
pub struct Agent {
    pub address: IpAddr,
    pub enabled: bool,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
    pub last_duration_ms: Option<i64>,
}

/// Supplies (or refreshes) the target list when it runs dry. Implementations
/// might read a static file, a service-discovery API, or a peer registry;
/// the core only needs the shape.
pub trait TargetSource: Send + Sync {
    fn discover(&self) -> Result<Vec<IpAddr>, String>;
}

/// A `TargetSource` that never discovers anything beyond what's already
/// configured; used when the Controller is seeded with an explicit,
/// unchanging target list.
pub struct StaticTargetSource;

impl TargetSource for StaticTargetSource {
    fn discover(&self) -> Result<Vec<IpAddr>, String> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSummary {
    pub scanner_running: bool,
    pub queued_jobs: usize,
    pub worker_count: usize,
}

/// Owns every component and is the sole lifecycle root: constructs them in
/// `init`, starts the Scheduler and periodic scanner in `start`, and tears
/// both down in `stop`.
pub struct Controller {
    config: ServiceConfig,
    scheduler: Arc<Scheduler>,
    aggregator: Arc<TopologyAggregator>,
    sink: Arc<dyn Sink>,
    target_source: Arc<dyn TargetSource>,
    agents: RwLock<HashMap<IpAddr, Agent>>,
    scanner_cancel: StdRwLock<Option<CancellationToken>>,
    scanner_handle: AsyncMutex<Option<JoinHandle<()>>>,
    /// Set after a discovery failure; `scan_once` skips discovery until
    /// this instant passes, enforcing the minimum retry back-off.
    discovery_backoff_until: StdRwLock<Option<Instant>>,
}

impl Controller {
    /// Construct every component and wire the Session-completion fan-out:
    /// each terminated Session reaches the Aggregator and the Sink.
    pub fn init(config: ServiceConfig) -> Result<Self, ControllerError> {
        let transport = Arc::new(Transport::new()?);
        let scheduler = Arc::new(Scheduler::new(transport.clone(), config.scheduler.queue_capacity));
        let aggregator = Arc::new(TopologyAggregator::new(config.aggregator.to_aggregator_options()));
        let sink: Arc<dyn Sink> = Arc::new(SqliteSink::open(
            std::path::Path::new(&config.persistence.database_path),
            config.persistence.to_sink_config(),
        )?);

        Ok(Self {
            config,
            scheduler,
            aggregator,
            sink,
            target_source: Arc::new(StaticTargetSource),
            agents: RwLock::new(HashMap::new()),
            scanner_cancel: StdRwLock::new(None),
            scanner_handle: AsyncMutex::new(None),
            discovery_backoff_until: StdRwLock::new(None),
        })
    }

    /// Swap in a target-discovery collaborator other than the no-op
    /// default; must be called before `start`.
    pub fn with_target_source(mut self, source: Arc<dyn TargetSource>) -> Self {
        self.target_source = source;
        self
    }

    pub fn seed_targets(&self, targets: impl IntoIterator<Item = IpAddr>) {
        let mut agents = self.agents.write();
        for address in targets {
            agents.entry(address).or_insert(Agent {
                address,
                enabled: true,
                last_seen: None,
                last_duration_ms: None,
            });
        }
    }

    pub fn enable_agent(&self, address: IpAddr) {
        if let Some(agent) = self.agents.write().get_mut(&address) {
            agent.enabled = true;
        }
    }

    pub fn disable_agent(&self, address: IpAddr) {
        if let Some(agent) = self.agents.write().get_mut(&address) {
            agent.enabled = false;
        }
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.agents.read().values().cloned().collect()
    }

    pub fn status(&self) -> StatusSummary {
        StatusSummary {
            scanner_running: self.scanner_cancel.read().unwrap().is_some(),
            queued_jobs: 0, // the bounded mpsc queue doesn't expose a length; Scheduler tracks active sessions instead.
            worker_count: self.config.scheduler.worker_count,
        }
    }

    /// Start the Scheduler and the periodic scanner. A no-op on sessions
    /// already running (same idempotency contract as `Scheduler::start`).
    pub fn start(self: &Arc<Self>) {
        self.scheduler.start(self.config.scheduler.worker_count);

        if self.scanner_cancel.read().unwrap().is_some() {
            return;
        }
        let Some(interval) = self.config.scan.interval() else {
            tracing::info!("periodic scanning disabled (scan.interval_secs = 0)");
            return;
        };

        let cancel = CancellationToken::new();
        *self.scanner_cancel.write().unwrap() = Some(cancel.clone());

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            controller.scanner_loop(interval, cancel).await;
        });

        // scanner_handle is only touched from start/stop, both of which run
        // on the controller's owning task, so a blocking try_lock suffices.
        if let Ok(mut guard) = self.scanner_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn scanner_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            self.scan_once();

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }

    fn scan_once(self: &Arc<Self>) {
        let targets: Vec<IpAddr> = {
            let agents = self.agents.read();
            agents.values().filter(|a| a.enabled).map(|a| a.address).collect()
        };

        let targets = if targets.is_empty() {
            if let Some(until) = *self.discovery_backoff_until.read().unwrap() {
                if Instant::now() < until {
                    return;
                }
            }

            match self.target_source.discover() {
                Ok(discovered) => {
                    *self.discovery_backoff_until.write().unwrap() = None;
                    self.seed_targets(discovered.iter().copied());
                    discovered
                }
                Err(e) => {
                    let backoff = self.config.scan.discovery_backoff();
                    *self.discovery_backoff_until.write().unwrap() = Some(Instant::now() + backoff);
                    tracing::warn!("target discovery failed, backing off for {backoff:?}: {e}");
                    return;
                }
            }
        } else {
            targets
        };

        for target in targets {
            let _ = self.scan_now(target, None);
        }
    }

    /// Enqueue an immediate trace for `address`, independent of whether it
    /// is an enabled periodic-scan agent.
    pub fn scan_now(self: &Arc<Self>, address: IpAddr, options: Option<SessionOptions>) -> Result<(), ControllerError> {
        let options = options.unwrap_or_else(|| self.config.mtr.to_session_options(self.config.aggregator.ring_size));
        let controller = self.clone();
        self.scheduler
            .schedule(address, options, Arc::new(move |session: TraceSession| controller.on_session_complete(session)))
            .map_err(ControllerError::from)
    }

    fn on_session_complete(&self, session: TraceSession) {
        let (signature, path) = TopologyAggregator::path_signature(&session);

        if let Some(agent) = self.agents.write().get_mut(&session.target()) {
            agent.last_seen = Some(session.ended_at());
            agent.last_duration_ms = Some(session.duration().as_millis() as i64);
        }

        if let Some(event) = self.aggregator.ingest(&session) {
            tracing::info!(
                target = %event.target,
                old = %event.old_signature,
                new = %event.new_signature,
                "path change detected"
            );
        }

        let sink = self.sink.clone();
        let vantage = self.config.vantage.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.write_session(&vantage, &session, &signature, &path).await {
                tracing::error!("session for {} failed to persist: {e}", session.target());
            }
        });
    }

    pub fn topology(&self, window: Duration, filter: Option<IpAddr>) -> Vec<(NodeId, NodeId, LinkStats)> {
        self.aggregator.topology(window, filter)
    }

    pub fn path_changes(&self, destination: Option<IpAddr>, window: Duration) -> Vec<PathChangeEvent> {
        self.aggregator.path_changes(destination, window)
    }

    pub fn current_paths(&self) -> Vec<CurrentPath> {
        self.aggregator.current_paths()
    }

    pub fn hop_stats(&self, destination: IpAddr, hop_address: IpAddr, window: Duration) -> Vec<HopSample> {
        self.aggregator.hop_stats(destination, hop_address, window)
    }

    /// Signal the scanner to exit, give in-flight jobs up to `timeout` to
    /// drain, then stop the Scheduler. If `timeout` elapses first, in-flight
    /// sessions are force-cancelled so the Scheduler still reaches `stopped`
    /// before this returns.
    pub async fn stop(&self, timeout: Duration) {
        if let Some(cancel) = self.scanner_cancel.write().unwrap().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.scanner_handle.lock().await.take() {
            let _ = tokio::time::timeout(timeout, handle).await;
        }

        let wait = self.scheduler.active_count() > 0;
        let mut stop_fut = Box::pin(self.scheduler.stop(wait));
        tokio::select! {
            _ = &mut stop_fut => {}
            _ = tokio::time::sleep(timeout) => {
                // The drain grace period elapsed with sessions still running:
                // force cancellation so their worker tasks actually exit, then
                // keep polling the same `stop` future to completion instead of
                // abandoning it (a second `stop` call would silently no-op,
                // since state already left `Running`).
                self.scheduler.cancel_in_flight();
                stop_fut.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_target_source_discovers_nothing() {
        assert_eq!(StaticTargetSource.discover(), Ok(Vec::new()));
    }

    #[test]
    fn seed_and_toggle_agents() {
        // Exercises the agent bookkeeping directly, since constructing a
        // full Controller requires CAP_NET_RAW via Transport::new.
        let agents: RwLock<HashMap<IpAddr, Agent>> = RwLock::new(HashMap::new());
        let addr = IpAddr::from([10, 0, 0, 1]);
        agents.write().insert(addr, Agent { address: addr, enabled: true, last_seen: None, last_duration_ms: None });

        agents.write().get_mut(&addr).unwrap().enabled = false;
        assert!(!agents.read().get(&addr).unwrap().enabled);
    }
}
