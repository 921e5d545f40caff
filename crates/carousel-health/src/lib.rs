//! carousel-health — health checking for rotated instances.
//!
//! Probes instance health endpoints and classifies each instance as
//! healthy, unhealthy or unknown. Degradation is slow and recovery fast:
//! an instance only flips to `Unhealthy` after `failure_threshold`
//! consecutive failures, and a single success restores `Healthy`. This
//! keeps the brief overlap windows of a rotation from flapping.
//!
//! # Architecture
//!
//! ```text
//! HealthChecker
//!   ├── Per-instance slot (one in-flight probe at a time)
//!   │   ├── HealthTracker (consecutive failures, backoff)
//!   │   └── HealthProbe::probe() under a hard timeout
//!   └── sweep() fans out across instances, skipping those in backoff
//!
//! HealthMonitor
//!   └── periodic sweep of running instances → channel → controller
//! ```
//!
//! Exponential backoff (interval → `max_backoff`) prevents hammering a
//! degraded container.

pub mod checker;
pub mod error;
pub mod monitor;
pub mod probe;
pub mod service;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use checker::{HealthTracker, ProbeResult, http_probe};
pub use error::{HealthError, HealthResult};
pub use monitor::HealthMonitor;
pub use probe::{HealthProbe, HttpProbe};
pub use service::{CheckerSettings, HealthChecker, HealthReport};
