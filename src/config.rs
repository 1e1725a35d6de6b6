//! The configuration surface named in the external-interfaces contract:
//! one `ServiceConfig` record, deserializable from TOML/JSON/env the way
//! the rest of this crate favors explicit option records over dynamic
//! attribute bags, with a `From` conversion into each component's own
//! options type.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persistence::SinkConfig;
use crate::session::SessionOptions;
use crate::topology::AggregatorOptions;

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// `scheduler.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub schedule_jitter_max_ms: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self { worker_count: 4, queue_capacity: 256, schedule_jitter_max_ms: 400 }
    }
}

impl SchedulerOptions {
    pub fn jitter_max(&self) -> Duration {
        millis(self.schedule_jitter_max_ms)
    }
}

/// `mtr.*` configuration keys, mirroring [`SessionOptions`]'s fields in
/// their wire/file-friendly form (milliseconds rather than `Duration`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtrOptions {
    pub probes_per_hop: u32,
    pub probe_timeout_ms: u64,
    pub inter_probe_delay_ms: u64,
    pub inter_hop_delay_ms: u64,
    pub max_hops: u8,
    pub max_consecutive_unknown_hops: u32,
}

impl Default for MtrOptions {
    fn default() -> Self {
        let defaults = SessionOptions::default();
        Self {
            probes_per_hop: defaults.probes_per_hop,
            probe_timeout_ms: defaults.probe_timeout.as_millis() as u64,
            inter_probe_delay_ms: defaults.inter_probe_delay.as_millis() as u64,
            inter_hop_delay_ms: defaults.inter_hop_delay.as_millis() as u64,
            max_hops: defaults.max_hops,
            max_consecutive_unknown_hops: defaults.max_consecutive_unknown_hops,
        }
    }
}

impl MtrOptions {
    pub fn to_session_options(&self, ring_size: usize) -> SessionOptions {
        SessionOptions {
            probes_per_hop: self.probes_per_hop,
            probe_timeout: millis(self.probe_timeout_ms),
            inter_probe_delay: millis(self.inter_probe_delay_ms),
            inter_hop_delay: millis(self.inter_hop_delay_ms),
            max_hops: self.max_hops,
            max_consecutive_unknown_hops: self.max_consecutive_unknown_hops,
            ring_size,
        }
    }
}

/// `aggregator.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub ring_size: usize,
    pub ema_sample_cap: u64,
    pub ema_alpha: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { ring_size: crate::hop_stats::DEFAULT_RING_SIZE, ema_sample_cap: 64, ema_alpha: 0.2 }
    }
}

impl AggregatorConfig {
    pub fn to_aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            ema_sample_cap: self.ema_sample_cap,
            ema_alpha: self.ema_alpha,
            ..AggregatorOptions::default()
        }
    }
}

/// `persistence.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub database_path: String,
    pub retry_budget: u32,
    pub retention_window_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: "mtr-topology.sqlite3".to_string(),
            retry_budget: 5,
            retention_window_secs: 7 * 24 * 3600,
        }
    }
}

impl PersistenceConfig {
    pub fn to_sink_config(&self) -> SinkConfig {
        SinkConfig {
            retry_budget: self.retry_budget,
            retry_base_delay: Duration::from_millis(100),
            retention_window: Duration::from_secs(self.retention_window_secs),
        }
    }
}

/// `scan.*` configuration keys governing the periodic scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Periodic loop period; `0` disables periodic scanning.
    pub interval_secs: u64,
    /// Minimum back-off after a target-discovery failure.
    pub discovery_backoff_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { interval_secs: 60, discovery_backoff_secs: 10 }
    }
}

impl ScanConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    pub fn discovery_backoff(&self) -> Duration {
        Duration::from_secs(self.discovery_backoff_secs.max(10))
    }
}

/// The complete, file/env-loadable configuration for one Controller
/// instance. The sampling vantage point's own label (`source` in the
/// persisted schema and the topology's `Source` node) lives here too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub vantage: String,
    pub mtr: MtrOptions,
    pub scheduler: SchedulerOptions,
    pub aggregator: AggregatorConfig,
    pub persistence: PersistenceConfig,
    pub scan: ScanConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            vantage: "local".to_string(),
            mtr: MtrOptions::default(),
            scheduler: SchedulerOptions::default(),
            aggregator: AggregatorConfig::default(),
            persistence: PersistenceConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}
