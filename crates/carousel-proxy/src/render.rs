//! Upstream block rendering.
//!
//! Output is deterministic: backends are sorted by name so the same set
//! always produces byte-identical text.

use serde::{Deserialize, Serialize};

const HEADER: &str = "# Managed by carousel. Manual edits are overwritten.";

/// One instance the proxy should route to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    /// `host:port`
    pub address: String,
}

impl Backend {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A rendered, not yet validated, proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedConfig {
    pub upstream: String,
    pub backends: Vec<Backend>,
    pub text: String,
}

impl RenderedConfig {
    /// Backend names in render order.
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name.as_str()).collect()
    }

    /// Recover a configuration previously written by `render`.
    ///
    /// Returns `None` for text carousel did not produce.
    pub fn parse(text: &str) -> Option<Self> {
        let mut upstream = None;
        let mut backends = Vec::new();

        for line in text.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("upstream ") {
                upstream = Some(rest.trim_end_matches('{').trim().to_string());
            } else if let Some(rest) = line.strip_prefix("server ") {
                let (address, comment) = rest.split_once(';')?;
                let name = comment.trim().strip_prefix('#')?.trim();
                backends.push(Backend::new(name, address.trim()));
            }
        }

        let upstream = upstream?;
        let rendered = render(&upstream, backends);
        (rendered.text == text).then_some(rendered)
    }
}

/// Render an nginx-style `upstream` block for `backends`.
pub fn render(upstream: &str, mut backends: Vec<Backend>) -> RenderedConfig {
    backends.sort();

    let mut text = String::new();
    text.push_str(HEADER);
    text.push('\n');
    text.push_str(&format!("upstream {upstream} {{\n"));
    for backend in &backends {
        text.push_str(&format!("    server {}; # {}\n", backend.address, backend.name));
    }
    text.push_str("}\n");

    RenderedConfig {
        upstream: upstream.to_string(),
        backends,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_sorts_backends() {
        let config = render(
            "carousel_backend",
            vec![Backend::new("web3", "web3:8080"), Backend::new("web1", "web1:8080")],
        );
        assert_eq!(config.names(), vec!["web1", "web3"]);
        assert_eq!(
            config.text,
            "# Managed by carousel. Manual edits are overwritten.\n\
             upstream carousel_backend {\n    \
             server web1:8080; # web1\n    \
             server web3:8080; # web3\n\
             }\n"
        );
    }

    #[test]
    fn render_is_order_independent() {
        let a = render("up", vec![Backend::new("a", "a:1"), Backend::new("b", "b:1")]);
        let b = render("up", vec![Backend::new("b", "b:1"), Backend::new("a", "a:1")]);
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn parse_recovers_rendered_config() {
        let config = render("up", vec![Backend::new("web2", "10.0.0.2:9000")]);
        assert_eq!(RenderedConfig::parse(&config.text), Some(config));
    }

    #[test]
    fn parse_rejects_foreign_text() {
        assert_eq!(RenderedConfig::parse("upstream x { server a:1; }\n"), None);
        assert_eq!(RenderedConfig::parse(""), None);
    }
}
