//! The container runtime seam.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LifecycleResult;

/// Runtime-level state of a container. Running is not the same as
/// application-healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    /// Restarting or otherwise on its way up.
    Starting,
    /// Created, exited, paused or dead.
    Stopped,
    /// No container with that name exists.
    Missing,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Runtime-assigned container id.
    pub id: Option<String>,
    pub status: RuntimeStatus,
    /// The container's own health-check verdict, if it defines one.
    pub runtime_health: Option<String>,
}

impl ContainerInfo {
    pub fn missing() -> Self {
        Self {
            id: None,
            status: RuntimeStatus::Missing,
            runtime_health: None,
        }
    }
}

/// Raw operations against a container runtime.
///
/// Implementations perform I/O only; waiting and timeouts live in
/// [`LifecycleManager`](crate::LifecycleManager).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> LifecycleResult<()>;

    /// Inspect a container by name. A missing container is
    /// `RuntimeStatus::Missing`, not an error.
    async fn inspect(&self, name: &str) -> LifecycleResult<ContainerInfo>;

    /// Ask the runtime to start a container. Already-running is success.
    async fn start(&self, name: &str) -> LifecycleResult<()>;

    /// Ask the runtime to stop a container, killing it after `grace`.
    /// Already-stopped is success.
    async fn stop(&self, name: &str, grace: Duration) -> LifecycleResult<()>;
}
