//! Error kinds surfaced by each component boundary.
//!
//! Errors internal to a single probe never propagate above the owning
//! [`crate::session::TraceSession`]; errors internal to a session surface as a
//! terminal [`crate::session::SessionStatus`], not as a propagated error.
//! Only component-initialization and controller-level failures are
//! returned as `Err` from public APIs.

use thiserror::Error;

/// Errors that can occur constructing or using the ICMP transport.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Raw socket creation failed, almost always because the process lacks
    /// `CAP_NET_RAW` (or isn't running as root).
    #[error("permission denied opening raw ICMP socket - requires elevated privileges")]
    PermissionDenied,

    /// The target's address family has no usable socket (e.g. IPv6 requested
    /// but the IPv6 ICMP socket failed to open at startup).
    #[error("address family unsupported by this transport")]
    UnsupportedFamily,

    /// The OS rejected the send call for a reason other than a permission
    /// problem detected at startup (network unreachable, etc). Per spec this
    /// is returned as a `send_error` outcome, not raised; this variant only
    /// exists so `Transport::new` can fail loudly for setup-time problems.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the [`crate::scheduler::Scheduler`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    NotRunning,

    #[error("job queue is full")]
    QueueFull,
}

/// Errors surfaced by a [`crate::persistence::Sink`] implementation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("persistence write failed after exhausting retry budget: {0}")]
    WriteFailed(String),

    #[error("persistence read failed: {0}")]
    ReadFailed(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors surfaced by the [`crate::controller::Controller`].
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("transport initialization failed: {0}")]
    Transport(#[from] ProbeError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("persistence error: {0}")]
    Sink(#[from] SinkError),

    #[error("target source discovery failed: {0}")]
    Discovery(String),
}
