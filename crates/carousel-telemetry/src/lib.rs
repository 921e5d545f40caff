//! carousel-telemetry — rotation history and derived metrics.
//!
//! Every finished rotation plan, successful or not, lands here. The
//! controller records through a cheap, non-blocking handle; persistence
//! to redb happens on a separate worker and its failures are only logged.
//!
//! # Components
//!
//! - **`history`**: bounded in-memory plans and availability samples
//! - **`recorder`**: the `Telemetry` handle, TTL snapshot cache, persist worker
//! - **`store`**: redb-backed plan table
//! - **`prometheus`**: text exposition for `/metrics`

pub mod error;
pub mod history;
pub mod prometheus;
pub mod recorder;
pub mod store;

pub use error::{TelemetryError, TelemetryResult};
pub use history::RotationHistory;
pub use prometheus::render_prometheus;
pub use recorder::{PersistWorker, Telemetry, TelemetrySettings};
pub use store::TelemetryStore;
