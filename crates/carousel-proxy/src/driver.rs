//! The proxy seam: lint a staged file, reload the live one.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};

/// Talks to the running reverse proxy.
#[async_trait]
pub trait ProxyDriver: Send + Sync {
    /// Lint the configuration staged at `path` without touching the live proxy.
    async fn validate(&self, path: &Path) -> ProxyResult<()>;

    /// Make the proxy pick up the live configuration file.
    async fn reload(&self) -> ProxyResult<()>;
}

/// Runs configured commands, e.g. `nginx -t -c {path}` and `nginx -s reload`.
///
/// `{path}` in any argument is replaced with the staged file. An empty
/// command is treated as always succeeding.
#[derive(Debug, Clone, Default)]
pub struct CommandDriver {
    validate: Vec<String>,
    reload: Vec<String>,
}

impl CommandDriver {
    pub fn new(validate: Vec<String>, reload: Vec<String>) -> Self {
        Self { validate, reload }
    }
}

/// Run `argv`, returning stderr (or stdout) on non-zero exit.
async fn run(argv: &[String], path: Option<&Path>) -> ProxyResult<Result<(), String>> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(Ok(()));
    };

    let args: Vec<String> = args
        .iter()
        .map(|arg| match path {
            Some(path) => arg.replace("{path}", &path.display().to_string()),
            None => arg.clone(),
        })
        .collect();

    debug!(%program, ?args, "running proxy command");
    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProxyError::Command {
            program: program.clone(),
            source,
        })?;

    if output.status.success() {
        return Ok(Ok(()));
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    Ok(Err(format!("{program} exited with {}: {message}", output.status)))
}

#[async_trait]
impl ProxyDriver for CommandDriver {
    async fn validate(&self, path: &Path) -> ProxyResult<()> {
        run(&self.validate, Some(path)).await?.map_err(ProxyError::Rejected)
    }

    async fn reload(&self) -> ProxyResult<()> {
        run(&self.reload, None).await?.map_err(ProxyError::Reload)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn empty_commands_succeed() {
        let driver = CommandDriver::default();
        driver.validate(Path::new("/nonexistent")).await.unwrap();
        driver.reload().await.unwrap();
    }

    #[tokio::test]
    async fn validate_substitutes_path() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged.conf");
        std::fs::write(&staged, "server ok;").unwrap();

        let driver = CommandDriver::new(sh("grep -q ok {path}"), Vec::new());
        driver.validate(&staged).await.unwrap();

        std::fs::write(&staged, "server bad;").unwrap();
        let err = driver.validate(&staged).await.unwrap_err();
        assert!(matches!(err, ProxyError::Rejected(_)));
    }

    #[tokio::test]
    async fn reload_failure_carries_stderr() {
        let driver = CommandDriver::new(Vec::new(), sh("echo 'no such pid' >&2; exit 1"));
        match driver.reload().await.unwrap_err() {
            ProxyError::Reload(msg) => assert!(msg.contains("no such pid")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_command_error() {
        let driver = CommandDriver::new(Vec::new(), vec!["/nonexistent/nginx".to_string()]);
        assert!(matches!(
            driver.reload().await.unwrap_err(),
            ProxyError::Command { .. }
        ));
    }
}
