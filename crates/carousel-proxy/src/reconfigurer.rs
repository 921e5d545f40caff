//! Proxy reconfigurer: validate-before-apply with last-known-good.
//!
//! The reconfigurer owns the live configuration file exclusively. The
//! bytes on disk after the last successful apply (or found at startup)
//! are the last-known-good configuration; every failure path puts them
//! back.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::driver::ProxyDriver;
use crate::error::{ProxyError, ProxyResult};
use crate::render::{Backend, RenderedConfig, render};

/// A configuration that passed local lint and the proxy's own validator.
///
/// Only `ProxyReconfigurer::validate` constructs one, so an unvalidated
/// configuration cannot reach `apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig(RenderedConfig);

impl ValidatedConfig {
    pub fn config(&self) -> &RenderedConfig {
        &self.0
    }
}

/// Renders, validates and atomically applies upstream configurations.
pub struct ProxyReconfigurer {
    driver: Arc<dyn ProxyDriver>,
    config_path: PathBuf,
    upstream: String,
    /// Live file contents considered good; `None` when no file existed.
    last_good: Option<Vec<u8>>,
    /// Parsed form of `last_good`, when carousel wrote it.
    active: Option<RenderedConfig>,
}

impl ProxyReconfigurer {
    /// Adopt whatever is currently at `config_path` as last-known-good.
    pub fn new(
        driver: Arc<dyn ProxyDriver>,
        config_path: impl Into<PathBuf>,
        upstream: impl Into<String>,
    ) -> ProxyResult<Self> {
        let config_path = config_path.into();
        let last_good = read_optional(&config_path)?;
        let active = last_good
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(RenderedConfig::parse);

        debug!(
            path = %config_path.display(),
            existing = last_good.is_some(),
            backends = ?active.as_ref().map(|c| c.names()),
            "proxy reconfigurer ready"
        );

        Ok(Self {
            driver,
            config_path,
            upstream: upstream.into(),
            last_good,
            active,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Last successfully applied configuration, if carousel wrote it.
    pub fn current(&self) -> Option<&RenderedConfig> {
        self.active.as_ref()
    }

    /// Render a configuration for `backends`. Pure; touches nothing.
    pub fn render(&self, backends: Vec<Backend>) -> RenderedConfig {
        render(&self.upstream, backends)
    }

    /// Lint locally, then run the proxy's validator against a staged copy.
    pub async fn validate(&self, config: RenderedConfig) -> ProxyResult<ValidatedConfig> {
        lint(&config)?;

        let staged = self.staged_path();
        write_atomic(&staged, config.text.as_bytes())?;
        let verdict = self.driver.validate(&staged).await;
        if let Err(e) = std::fs::remove_file(&staged) {
            debug!(path = %staged.display(), error = %e, "failed to remove staged config");
        }

        match verdict {
            Ok(()) => {
                debug!(backends = ?config.names(), "proxy configuration validated");
                Ok(ValidatedConfig(config))
            }
            Err(e) => {
                warn!(backends = ?config.names(), error = %e, "proxy configuration rejected");
                Err(e)
            }
        }
    }

    /// Swap the live file and reload the proxy.
    ///
    /// Either the new backend set is live, or the last-known-good file is
    /// back in place and the proxy has been asked to reload it.
    pub async fn apply(&mut self, validated: ValidatedConfig) -> ProxyResult<()> {
        let config = validated.0;
        write_atomic(&self.config_path, config.text.as_bytes())?;

        match self.driver.reload().await {
            Ok(()) => {
                info!(backends = ?config.names(), "proxy configuration applied");
                self.last_good = Some(config.text.clone().into_bytes());
                self.active = Some(config);
                Ok(())
            }
            Err(e) => {
                error!(backends = ?config.names(), error = %e, "proxy reload failed, restoring last-known-good");
                if let Err(restore_err) = self.put_back_last_good().await {
                    error!(error = %restore_err, "failed to restore last-known-good proxy configuration");
                }
                Err(e)
            }
        }
    }

    /// Ensure the live file holds the last-known-good bytes.
    ///
    /// Used after an interrupted apply. Returns `true` if anything had to
    /// be rewritten.
    pub async fn restore(&self) -> ProxyResult<bool> {
        let on_disk = read_optional(&self.config_path)?;
        if on_disk == self.last_good {
            return Ok(false);
        }
        warn!(path = %self.config_path.display(), "live proxy configuration diverged, restoring");
        self.put_back_last_good().await?;
        Ok(true)
    }

    async fn put_back_last_good(&self) -> ProxyResult<()> {
        match &self.last_good {
            Some(bytes) => write_atomic(&self.config_path, bytes)?,
            None => match std::fs::remove_file(&self.config_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ProxyError::io(&self.config_path, e)),
            },
        }
        self.driver.reload().await
    }

    fn staged_path(&self) -> PathBuf {
        let mut name = self
            .config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "carousel-upstream".into());
        name.push(".staged");
        self.config_path.with_file_name(name)
    }
}

fn lint(config: &RenderedConfig) -> ProxyResult<()> {
    if config.backends.is_empty() {
        return Err(ProxyError::EmptyBackendSet);
    }
    let mut names = HashSet::new();
    let mut addresses = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            return Err(ProxyError::DuplicateBackend(backend.name.clone()));
        }
        if !addresses.insert(backend.address.as_str()) {
            return Err(ProxyError::DuplicateBackend(backend.address.clone()));
        }
        if backend.address.trim().is_empty() || backend.address.contains([';', '{', '}', '\n']) {
            return Err(ProxyError::Rejected(format!(
                "invalid address {:?} for {}",
                backend.address, backend.name
            )));
        }
    }
    Ok(())
}

fn read_optional(path: &Path) -> ProxyResult<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProxyError::io(path, e)),
    }
}

/// Write via a temp file in the same directory and rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> ProxyResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ProxyError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| ProxyError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| ProxyError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| ProxyError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    fn backends(names: &[&str]) -> Vec<Backend> {
        names.iter().map(|n| Backend::new(*n, format!("{n}:8080"))).collect()
    }

    fn setup() -> (tempfile::TempDir, Arc<MockDriver>, ProxyReconfigurer) {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let proxy = ProxyReconfigurer::new(driver.clone(), dir.path().join("upstream.conf"), "carousel_backend")
            .unwrap();
        (dir, driver, proxy)
    }

    #[tokio::test]
    async fn apply_writes_and_reloads() {
        let (_dir, driver, mut proxy) = setup();
        let config = proxy.render(backends(&["web1", "web2"]));
        let validated = proxy.validate(config.clone()).await.unwrap();
        proxy.apply(validated).await.unwrap();

        let live = std::fs::read_to_string(proxy.config_path()).unwrap();
        assert_eq!(live, config.text);
        assert_eq!(proxy.current(), Some(&config));
        assert_eq!(driver.reload_count(), 1);
        assert_eq!(driver.validated(), vec![config.text]);
    }

    #[tokio::test]
    async fn empty_set_never_reaches_driver() {
        let (_dir, driver, proxy) = setup();
        let err = proxy.validate(proxy.render(Vec::new())).await.unwrap_err();
        assert!(matches!(err, ProxyError::EmptyBackendSet));
        assert!(driver.validated().is_empty());
    }

    #[tokio::test]
    async fn duplicate_address_is_rejected() {
        let (_dir, _driver, proxy) = setup();
        let config = proxy.render(vec![Backend::new("a", "x:1"), Backend::new("b", "x:1")]);
        assert!(matches!(
            proxy.validate(config).await,
            Err(ProxyError::DuplicateBackend(addr)) if addr == "x:1"
        ));
    }

    #[tokio::test]
    async fn rejected_config_leaves_live_file_alone() {
        let (_dir, driver, mut proxy) = setup();
        let first = proxy.validate(proxy.render(backends(&["web1"]))).await.unwrap();
        proxy.apply(first).await.unwrap();
        let before = std::fs::read(proxy.config_path()).unwrap();

        driver.reject_validation(true);
        let err = proxy.validate(proxy.render(backends(&["web2"]))).await.unwrap_err();
        assert!(matches!(err, ProxyError::Rejected(_)));
        assert_eq!(std::fs::read(proxy.config_path()).unwrap(), before);
        assert!(!proxy.staged_path().exists());
    }

    #[tokio::test]
    async fn failed_reload_restores_previous_bytes() {
        let (_dir, driver, mut proxy) = setup();
        let first = proxy.validate(proxy.render(backends(&["web1"]))).await.unwrap();
        proxy.apply(first).await.unwrap();
        let before = std::fs::read(proxy.config_path()).unwrap();

        driver.fail_reloads(1);
        let next = proxy.validate(proxy.render(backends(&["web1", "web2"]))).await.unwrap();
        let err = proxy.apply(next).await.unwrap_err();
        assert!(matches!(err, ProxyError::Reload(_)));

        assert_eq!(std::fs::read(proxy.config_path()).unwrap(), before);
        assert_eq!(proxy.current().unwrap().names(), vec!["web1"]);
        // Failed reload, then the reload of the restored file.
        assert_eq!(driver.reload_count(), 3);
    }

    #[tokio::test]
    async fn failed_first_apply_removes_file() {
        let (_dir, driver, mut proxy) = setup();
        driver.fail_reloads(1);
        let config = proxy.validate(proxy.render(backends(&["web1"]))).await.unwrap();
        assert!(proxy.apply(config).await.is_err());
        assert!(!proxy.config_path().exists());
    }

    #[tokio::test]
    async fn restore_repairs_diverged_file() {
        let (_dir, _driver, mut proxy) = setup();
        let config = proxy.validate(proxy.render(backends(&["web1"]))).await.unwrap();
        proxy.apply(config).await.unwrap();
        let good = std::fs::read(proxy.config_path()).unwrap();

        assert!(!proxy.restore().await.unwrap());

        std::fs::write(proxy.config_path(), b"half written").unwrap();
        assert!(proxy.restore().await.unwrap());
        assert_eq!(std::fs::read(proxy.config_path()).unwrap(), good);
    }

    #[tokio::test]
    async fn adopts_existing_file_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upstream.conf");
        let existing = render("carousel_backend", backends(&["web3"]));
        std::fs::write(&path, &existing.text).unwrap();

        let proxy = ProxyReconfigurer::new(Arc::new(MockDriver::new()), &path, "carousel_backend").unwrap();
        assert_eq!(proxy.current(), Some(&existing));
    }
}
