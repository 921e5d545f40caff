//! carousel-proxy — reverse proxy reconfiguration for Carousel.
//!
//! Turns the set of healthy Active instances into an upstream block for
//! the reverse proxy and swaps it in. The three steps stay separate:
//!
//! - **`render`**: pure text generation from a backend set
//! - **validate**: local lint, then the proxy's own linter against a
//!   staged copy; only a `ValidatedConfig` can be applied
//! - **apply**: atomic rename over the live file, then reload; a failed
//!   reload puts the last-known-good file back and reloads again
//!
//! The proxy itself is driven through the `ProxyDriver` seam
//! (`CommandDriver` runs configured commands such as `nginx -t`).

pub mod driver;
pub mod error;
pub mod reconfigurer;
pub mod render;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use driver::{CommandDriver, ProxyDriver};
pub use error::{ProxyError, ProxyResult};
pub use reconfigurer::{ProxyReconfigurer, ValidatedConfig};
pub use render::{Backend, RenderedConfig};
