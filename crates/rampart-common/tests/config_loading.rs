//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "tests"
//! rampart_type: "source"
//! rampart_scope: "test"
//! rampart_description: "Configuration discovery integration tests."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::fs;

use anyhow::{anyhow, Result};
use rampart_common::config::{from_path, load_with_source, LoggingConfig, Validate};
use rampart_common::LogFormat;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DaemonSection {
    service: String,
    #[serde(default)]
    logging: LoggingConfig,
}

impl Validate for DaemonSection {
    fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(anyhow!("service name is required"));
        }
        Ok(())
    }
}

#[test]
fn first_existing_candidate_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("present.toml");
    fs::write(
        &present,
        r#"
        service = "edge"

        [logging]
        format = "pretty"
        file_output = false
        "#,
    )
    .unwrap();

    let loaded = load_with_source::<DaemonSection, _>(
        "RAMPART_CONFIG_TEST_FIRST_CANDIDATE",
        &[missing, present.clone()],
    )
    .unwrap();
    assert_eq!(loaded.source, present);
    assert_eq!(loaded.config.service, "edge");
    assert_eq!(loaded.config.logging.format, LogFormat::Pretty);
    assert!(!loaded.config.logging.file_output);
}

#[test]
fn environment_override_wins() {
    let dir = tempfile::tempdir().unwrap();
    let candidate = dir.path().join("candidate.toml");
    let override_path = dir.path().join("override.toml");
    fs::write(&candidate, "service = \"candidate\"").unwrap();
    fs::write(&override_path, "service = \"override\"").unwrap();

    let var = "RAMPART_CONFIG_TEST_ENV_OVERRIDE";
    std::env::set_var(var, &override_path);
    let loaded = load_with_source::<DaemonSection, _>(var, &[candidate]).unwrap();
    std::env::remove_var(var);

    assert_eq!(loaded.source, override_path);
    assert_eq!(loaded.config.service, "override");
}

#[test]
fn invalid_document_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "service = \"\"").unwrap();

    let err = from_path::<DaemonSection>(&path).unwrap_err();
    let rendered = format!("{err:#}");
    assert!(rendered.contains("broken.toml"));
    assert!(rendered.contains("service name is required"));
}
