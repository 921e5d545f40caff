//! carousel-lifecycle — container start/stop/inspect for Carousel.
//!
//! A thin wrapper over the container runtime. Every operation is
//! idempotent: starting a running container or stopping a stopped one is
//! a successful no-op. `start` blocks until the runtime reports the
//! container running (not application-healthy) or the start timeout
//! elapses.
//!
//! # Components
//!
//! - **`runtime`**: the `ContainerRuntime` seam and `RuntimeStatus`
//! - **`docker`**: Docker Engine API client over a unix socket or TCP
//! - **`manager`**: `LifecycleManager`, bounded waits and timeouts

pub mod docker;
pub mod error;
pub mod manager;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use docker::DockerRuntime;
pub use error::{LifecycleError, LifecycleResult};
pub use manager::LifecycleManager;
pub use runtime::{ContainerInfo, ContainerRuntime, RuntimeStatus};
