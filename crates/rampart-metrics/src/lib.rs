//! ---
//! rampart_section: "03-observability"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Metrics registry and text exposition utilities."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Registry, TextEncoder};

/// Shared registry type used across components.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Produce a registry whose metric names are prefixed, for hosts embedding several cores.
pub fn new_prefixed_registry(prefix: &str) -> Result<SharedRegistry> {
    let registry = Registry::new_custom(Some(prefix.to_owned()), None)
        .with_context(|| format!("invalid metrics prefix '{}'", prefix))?;
    Ok(Arc::new(registry))
}

/// Render every gathered family in the Prometheus text exposition format.
pub fn encode_text(registry: &SharedRegistry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};

    #[test]
    fn encodes_registered_counter() {
        let registry = new_registry();
        let counter = IntCounter::with_opts(Opts::new("probe_total", "probe counter")).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc_by(3);
        let text = encode_text(&registry).unwrap();
        assert!(text.contains("probe_total 3"));
    }

    #[test]
    fn prefixed_registry_prefixes_names() {
        let registry = new_prefixed_registry("edge").unwrap();
        let counter = IntCounter::with_opts(Opts::new("calls_total", "calls")).unwrap();
        registry.register(Box::new(counter)).unwrap();
        let text = encode_text(&registry).unwrap();
        assert!(text.contains("edge_calls_total"));
    }
}
