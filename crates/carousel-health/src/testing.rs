//! Scripted probe for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::checker::ProbeResult;
use crate::probe::HealthProbe;

#[derive(Default)]
struct Script {
    queued: VecDeque<ProbeResult>,
    default: Option<ProbeResult>,
    delay: Duration,
    calls: u32,
}

/// `HealthProbe` answering from per-address scripts.
///
/// Queued results are consumed first, then the address default applies.
/// Addresses with no script answer `Healthy`.
#[derive(Default)]
pub struct ScriptedProbe {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<R>(&self, address: &str, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        f(scripts.entry(address.to_string()).or_default())
    }

    /// Answer `result` once queued results are exhausted.
    pub fn set_default(&self, address: &str, result: ProbeResult) {
        self.with_script(address, |s| s.default = Some(result));
    }

    /// Queue results to be returned in order.
    pub fn push(&self, address: &str, results: &[ProbeResult]) {
        self.with_script(address, |s| s.queued.extend(results.iter().copied()));
    }

    /// Sleep before answering, to exercise probe timeouts.
    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.with_script(address, |s| s.delay = delay);
    }

    /// Number of probes issued against `address`.
    pub fn calls(&self, address: &str) -> u32 {
        self.with_script(address, |s| s.calls)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, address: &str) -> ProbeResult {
        let (result, delay) = self.with_script(address, |s| {
            s.calls += 1;
            let result = s
                .queued
                .pop_front()
                .or(s.default)
                .unwrap_or(ProbeResult::Healthy);
            (result, s.delay)
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}
