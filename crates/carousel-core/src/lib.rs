//! carousel-core — shared data model and configuration for Carousel.
//!
//! Carousel keeps a small set of interchangeable document-service
//! containers behind a reverse proxy and rotates which of them serve
//! traffic. This crate holds the types every other crate agrees on:
//!
//! - **`types`**: instances, rotation plans, telemetry snapshots, status views
//! - **`config`**: the TOML configuration loaded once at startup
//! - **`duration`**: `"5s"` / `"500ms"` style duration strings

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
