//! Active MTR probing engine and topology aggregator.
//!
//! `probe` owns the raw ICMP transport, `hop_stats` and `session` turn
//! probe replies into a running traceroute session, `scheduler` runs many
//! sessions concurrently, `topology` folds completed sessions into a
//! queryable node/link graph with path-change detection, `persistence`
//! writes sessions to SQLite, and `controller` wires all of the above into
//! one long-running service.

pub mod config;
pub mod controller;
pub mod error;
pub mod hop_stats;
pub mod persistence;
pub mod probe;
pub mod scheduler;
pub mod session;
pub mod topology;

pub use config::ServiceConfig;
pub use controller::{Agent, Controller, StaticTargetSource, StatusSummary, TargetSource};
pub use error::{ControllerError, ProbeError, SchedulerError, SinkError};
pub use hop_stats::HopStats;
pub use persistence::{Sink, SinkConfig, SqliteSink};
pub use probe::{OutcomeKind, ProbeOutcome, ProbeSource, Transport};
pub use scheduler::{Scheduler, SchedulerState};
pub use session::{AbortReason, SessionOptions, SessionStatus, TraceSession};
pub use topology::{CurrentPath, HopSample, LinkStats, NodeId, PathChangeEvent, TopologyAggregator};

pub use std::net::IpAddr;
pub use std::time::Duration;
