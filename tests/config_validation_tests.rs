//! Config Validation Tests
//!
//! Typo detection with suggestions, and consistency checks that reject a
//! config before any component is built from it.

use std::io::Write;

use stagewarden::config::validation::{known_config_keys, suggest_correction, validate_unknown_keys};
use stagewarden::config::{ConfigError, PipelineConfig};
use stagewarden::types::{ActionType, AuditKind, Stage};

fn validation_errors(result: Result<PipelineConfig, ConfigError>) -> Vec<String> {
    match result {
        Err(ConfigError::Validation(errors)) => errors,
        Err(other) => panic!("expected validation error, got {other}"),
        Ok(_) => panic!("expected validation error, config was accepted"),
    }
}

// ============================================================================
// Typo Detection
// ============================================================================

#[test]
fn typo_in_slo_key_warns_with_suggestion() {
    let toml_str = r#"
[slo]
observr_ms = 1800
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert_eq!(warnings[0].field, "slo.observr_ms");
    assert_eq!(warnings[0].suggestion.as_deref(), Some("slo.observer_ms"));
}

#[test]
fn unknown_section_warns() {
    let warnings = validate_unknown_keys("[telemetry]\nenabled = true\n");
    assert!(warnings.iter().any(|w| w.field == "telemetry"));
}

#[test]
fn typo_does_not_fail_the_load() {
    let config = PipelineConfig::from_toml_str("[workers]\npool_sise = 9\n").unwrap();
    assert_eq!(config.workers.pool_size, PipelineConfig::default().workers.pool_size);
}

#[test]
fn distant_key_gets_no_suggestion() {
    let known = known_config_keys();
    assert!(suggest_correction("completely.unrelated.thing", &known).is_none());
}

#[test]
fn escalation_rule_entries_are_not_flagged() {
    let toml_str = r#"
[[escalation.rules]]
name = "doer_timeouts"
kind = "stage_timeout"
stage = "doer"
severity = "SEV-3"
case_priority = "P3"
"#;
    assert!(validate_unknown_keys(toml_str).is_empty());
}

// ============================================================================
// Consistency Checks
// ============================================================================

#[test]
fn defaults_are_valid() {
    PipelineConfig::default().validate().unwrap();
}

#[test]
fn end_to_end_shorter_than_a_stage_is_rejected() {
    let errors = validation_errors(PipelineConfig::from_toml_str(
        "[slo]\nobserver_ms = 4000\nend_to_end_ms = 3000\n",
    ));
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("slo.end_to_end_ms"));
}

#[test]
fn every_error_is_collected() {
    let toml_str = r#"
[degradation]
min_confidence = 1.5
min_groundedness = -0.1

[workers]
pool_size = 0

[[escalation.rules]]
name = "dup"
kind = "tool_error"
threshold = 0
severity = "SEV-4"
case_priority = "P4"

[[escalation.rules]]
name = "dup"
kind = "incident_created"
severity = "SEV-4"
case_priority = "P4"
"#;
    let errors = validation_errors(PipelineConfig::from_toml_str(toml_str));
    let joined = errors.join("\n");
    assert!(joined.contains("degradation.min_confidence"));
    assert!(joined.contains("degradation.min_groundedness"));
    assert!(joined.contains("workers.pool_size"));
    assert!(joined.contains("threshold must be > 0"));
    assert!(joined.contains("defined more than once"));
    assert!(joined.contains("cannot escalate on incident_created"));
    assert_eq!(errors.len(), 6);
}

#[test]
fn inverted_backoff_bounds_are_rejected() {
    let errors = validation_errors(PipelineConfig::from_toml_str(
        "[dispatcher]\nbase_backoff_ms = 500\nmax_backoff_ms = 100\n",
    ));
    assert!(errors[0].contains("max_backoff_ms"));
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn load_from_file_reads_every_section() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[service]
name = "stagewarden-line-4"

[slo]
thinker_ms = 1800

[degradation]
ceiling = "log"

[escalation]
cooldown_secs = 30

[[escalation.rules]]
name = "doer_timeouts"
kind = "stage_timeout"
stage = "doer"
threshold = 2
severity = "SEV-3"
case_priority = "P3"
"#
    )
    .unwrap();

    let config = PipelineConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.service.name, "stagewarden-line-4");
    assert_eq!(config.slo.thinker_ms, 1800);
    assert_eq!(config.slo.observer_ms, 2_500);
    assert_eq!(config.degradation.ceiling, ActionType::Log);
    assert_eq!(config.escalation.cooldown_secs, 30);
    assert_eq!(config.escalation.rules.len(), 1);
    assert_eq!(config.escalation.rules[0].kind, AuditKind::StageTimeout);
    assert_eq!(config.escalation.rules[0].stage, Some(Stage::Doer));
}

#[test]
fn missing_file_is_an_io_error() {
    let err = PipelineConfig::load_from_file(std::path::Path::new("/nonexistent/stagewarden.toml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Io(..)));
}

#[test]
fn serialized_defaults_load_back() {
    let text = PipelineConfig::default().to_toml().unwrap();
    let config = PipelineConfig::from_toml_str(&text).unwrap();
    assert_eq!(config.escalation.rules.len(), PipelineConfig::default().escalation.rules.len());
}
