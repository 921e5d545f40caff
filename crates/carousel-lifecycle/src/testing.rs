//! Scripted in-memory runtime for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LifecycleError, LifecycleResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, RuntimeStatus};

/// A runtime operation that reached the scripted runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(String),
    Stop(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartBehavior {
    Normal,
    Fail,
    Hang,
    Crash,
}

struct Container {
    id: String,
    status: RuntimeStatus,
    start: StartBehavior,
    stop_failures: u32,
}

struct Inner {
    containers: HashMap<String, Container>,
    available: bool,
    start_delay: Duration,
    calls: Vec<RuntimeCall>,
}

/// In-memory `ContainerRuntime` whose behavior tests script per container.
pub struct ScriptedRuntime {
    inner: Mutex<Inner>,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                containers: HashMap::new(),
                available: true,
                start_delay: Duration::ZERO,
                calls: Vec::new(),
            }),
        }
    }

    /// Register a container in the given state.
    pub fn with_container(self, name: &str, status: RuntimeStatus) -> Self {
        {
            let mut inner = self.lock();
            let id = format!("id-{name}");
            inner.containers.insert(
                name.to_string(),
                Container {
                    id,
                    status,
                    start: StartBehavior::Normal,
                    stop_failures: 0,
                },
            );
        }
        self
    }

    pub fn status(&self, name: &str) -> RuntimeStatus {
        self.lock()
            .containers
            .get(name)
            .map(|c| c.status)
            .unwrap_or(RuntimeStatus::Missing)
    }

    pub fn set_status(&self, name: &str, status: RuntimeStatus) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.status = status;
        }
    }

    /// Start calls for `name` return an API error.
    pub fn fail_start(&self, name: &str) {
        self.set_start(name, StartBehavior::Fail);
    }

    /// Start calls for `name` succeed but the container never leaves Starting.
    pub fn hang_start(&self, name: &str) {
        self.set_start(name, StartBehavior::Hang);
    }

    /// Start calls for `name` succeed but the container exits immediately.
    pub fn crash_on_start(&self, name: &str) {
        self.set_start(name, StartBehavior::Crash);
    }

    /// The next `times` stop calls for `name` fail.
    pub fn fail_stop_times(&self, name: &str, times: u32) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.stop_failures = times;
        }
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Delay every start call, to hold a rotation in flight.
    pub fn set_start_delay(&self, delay: Duration) {
        self.lock().start_delay = delay;
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    pub fn start_count(&self, name: &str) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Start(n) if n == name))
    }

    pub fn stop_count(&self, name: &str) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Stop(n) if n == name))
    }

    fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(*c)).count()
    }

    fn set_start(&self, name: &str, behavior: StartBehavior) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.start = behavior;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> LifecycleResult<()> {
        if self.lock().available {
            Ok(())
        } else {
            Err(LifecycleError::Unavailable("scripted runtime offline".to_string()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn ping(&self) -> LifecycleResult<()> {
        self.check_available()
    }

    async fn inspect(&self, name: &str) -> LifecycleResult<ContainerInfo> {
        self.check_available()?;
        let inner = self.lock();
        Ok(match inner.containers.get(name) {
            Some(c) => ContainerInfo {
                id: Some(c.id.clone()),
                status: c.status,
                runtime_health: None,
            },
            None => ContainerInfo::missing(),
        })
    }

    async fn start(&self, name: &str) -> LifecycleResult<()> {
        self.check_available()?;
        let delay = self.lock().start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        inner.calls.push(RuntimeCall::Start(name.to_string()));
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        match container.start {
            StartBehavior::Normal => container.status = RuntimeStatus::Running,
            StartBehavior::Hang => container.status = RuntimeStatus::Starting,
            StartBehavior::Crash => container.status = RuntimeStatus::Stopped,
            StartBehavior::Fail => {
                return Err(LifecycleError::Api {
                    status: 500,
                    message: format!("scripted start failure for {name}"),
                });
            }
        }
        Ok(())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> LifecycleResult<()> {
        self.check_available()?;
        let mut inner = self.lock();
        inner.calls.push(RuntimeCall::Stop(name.to_string()));
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if container.stop_failures > 0 {
            container.stop_failures -= 1;
            return Err(LifecycleError::Api {
                status: 500,
                message: format!("scripted stop failure for {name}"),
            });
        }
        container.status = RuntimeStatus::Stopped;
        Ok(())
    }
}
