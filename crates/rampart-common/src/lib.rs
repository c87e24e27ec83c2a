//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Shared primitives and utilities for the Rampart workspace."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
//! Core shared primitives for the Rampart resilience workspace.
//! This crate exposes configuration loading, logging, and time helpers
//! consumed by the resilience core and the daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{load_with_source, Loaded, LoggingConfig, Validate, ENV_CONFIG_PATH};
pub use logging::{init_tracing, LogFormat};
