//! In-memory proxy driver for tests.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::ProxyDriver;
use crate::error::{ProxyError, ProxyResult};

#[derive(Default)]
struct State {
    reject: bool,
    reload_failures: u32,
    reloads: u32,
    reload_delay: Duration,
    validated: Vec<String>,
}

/// `ProxyDriver` that records calls and fails on demand.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<State>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject every validation while `reject` is set.
    pub fn reject_validation(&self, reject: bool) {
        self.lock().reject = reject;
    }

    /// Fail the next `times` reloads.
    pub fn fail_reloads(&self, times: u32) {
        self.lock().reload_failures = times;
    }

    /// Sleep before every reload answers, to hold a cutover in flight.
    pub fn set_reload_delay(&self, delay: Duration) {
        self.lock().reload_delay = delay;
    }

    /// Total reload calls, failed ones included.
    pub fn reload_count(&self) -> u32 {
        self.lock().reloads
    }

    /// Contents of every staged file passed to `validate`.
    pub fn validated(&self) -> Vec<String> {
        self.lock().validated.clone()
    }
}

#[async_trait]
impl ProxyDriver for MockDriver {
    async fn validate(&self, path: &Path) -> ProxyResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| ProxyError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut state = self.lock();
        state.validated.push(text);
        if state.reject {
            return Err(ProxyError::Rejected("scripted rejection".to_string()));
        }
        Ok(())
    }

    async fn reload(&self) -> ProxyResult<()> {
        let delay = self.lock().reload_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.reloads += 1;
        if state.reload_failures > 0 {
            state.reload_failures -= 1;
            return Err(ProxyError::Reload("scripted reload failure".to_string()));
        }
        Ok(())
    }
}
