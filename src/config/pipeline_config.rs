//! Pipeline Configuration - every deadline and threshold as TOML values
//!
//! Each struct implements `Default` so the binary runs with no config file.
//! The defaults are starting points for a demo deployment, not tuned values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults::{CONFIG_ENV_VAR, LOCAL_CONFIG_FILE};
use crate::types::{ActionType, AuditKind, CasePriority, IncidentSeverity, Stage};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one pipeline deployment.
///
/// Load with `PipelineConfig::load()` which searches:
/// 1. `$STAGEWARDEN_CONFIG` env var
/// 2. `./stagewarden.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Deployment identification
    #[serde(default)]
    pub service: ServiceInfo,

    /// Per-stage and end-to-end deadlines
    #[serde(default)]
    pub slo: SloConfig,

    /// Confidence-based action downgrade
    #[serde(default)]
    pub degradation: DegradationConfig,

    /// Action delivery retry policy
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Incident / case escalation rules
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Intake queue and worker pool sizing
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Audit log storage
    #[serde(default)]
    pub audit: AuditConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl PipelineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$STAGEWARDEN_CONFIG` environment variable
    /// 2. `./stagewarden.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), service = %config.service.name, "Loaded pipeline config from {CONFIG_ENV_VAR}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {CONFIG_ENV_VAR}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV_VAR} points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(service = %config.service.name, "Loaded pipeline config from ./{LOCAL_CONFIG_FILE}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{LOCAL_CONFIG_FILE}, using defaults");
                }
            }
        }

        info!("No {LOCAL_CONFIG_FILE} found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    ///
    /// Unknown keys are logged as warnings and never fail the load.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all values for internal consistency.
    ///
    /// Rules:
    /// - Every deadline must be > 0
    /// - The end-to-end deadline must cover the slowest single stage
    /// - Degradation thresholds must sit in [0, 1]
    /// - Backoff bounds must be ordered
    /// - Pool and queue sizes must be > 0
    /// - Escalation rules need unique names and thresholds > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let s = &self.slo;
        for (name, ms) in [
            ("slo.observer_ms", s.observer_ms),
            ("slo.thinker_ms", s.thinker_ms),
            ("slo.doer_ms", s.doer_ms),
            ("slo.dispatcher_ms", s.dispatcher_ms),
            ("slo.end_to_end_ms", s.end_to_end_ms),
        ] {
            if ms == 0 {
                errors.push(format!("{name} must be > 0"));
            }
        }
        let slowest = s.observer_ms.max(s.thinker_ms).max(s.doer_ms);
        if s.end_to_end_ms < slowest {
            errors.push(format!(
                "slo.end_to_end_ms ({}) must be >= the slowest stage deadline ({slowest})",
                s.end_to_end_ms
            ));
        }

        let d = &self.degradation;
        Self::check_unit_interval(d.min_confidence, "degradation.min_confidence", &mut errors);
        Self::check_unit_interval(d.min_groundedness, "degradation.min_groundedness", &mut errors);

        let p = &self.dispatcher;
        if p.base_backoff_ms == 0 {
            errors.push("dispatcher.base_backoff_ms must be > 0".to_string());
        }
        if p.max_backoff_ms < p.base_backoff_ms {
            errors.push(format!(
                "dispatcher.max_backoff_ms ({}) must be >= base_backoff_ms ({})",
                p.max_backoff_ms, p.base_backoff_ms
            ));
        }

        if self.workers.pool_size == 0 {
            errors.push("workers.pool_size must be > 0".to_string());
        }
        if self.workers.intake_capacity == 0 {
            errors.push("workers.intake_capacity must be > 0".to_string());
        }
        if self.audit.capacity == 0 {
            errors.push("audit.capacity must be > 0".to_string());
        }
        if self.escalation.channel_capacity == 0 {
            errors.push("escalation.channel_capacity must be > 0".to_string());
        }

        let mut names = HashSet::new();
        for rule in &self.escalation.rules {
            if !names.insert(rule.name.as_str()) {
                errors.push(format!("escalation rule '{}' is defined more than once", rule.name));
            }
            if rule.threshold == 0 {
                errors.push(format!("escalation rule '{}': threshold must be > 0", rule.name));
            }
            if rule.window_secs == 0 {
                errors.push(format!("escalation rule '{}': window_secs must be > 0", rule.name));
            }
            if matches!(rule.kind, AuditKind::IncidentCreated | AuditKind::CaseCreated) {
                errors.push(format!(
                    "escalation rule '{}': cannot escalate on {} events",
                    rule.name, rule.kind
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_unit_interval(value: f64, name: &str, errors: &mut Vec<String>) {
        // NaN comparisons silently pass, catch them explicitly
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            errors.push(format!("{name} = {value} must be within [0, 1]"));
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),
    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// Service Info
// ============================================================================

/// Identification metadata. Appears in logs and the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Free-form deployment label ("dev", "plant-3", ...)
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_service_name() -> String {
    "stagewarden".to_string()
}
fn default_environment() -> String {
    "dev".to_string()
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            environment: default_environment(),
        }
    }
}

// ============================================================================
// SLO Config
// ============================================================================

/// Deadline table for the pipeline. Immutable for the life of an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    #[serde(default = "default_observer_ms")]
    pub observer_ms: u64,

    #[serde(default = "default_thinker_ms")]
    pub thinker_ms: u64,

    #[serde(default = "default_doer_ms")]
    pub doer_ms: u64,

    /// Deadline for a single delivery attempt
    #[serde(default = "default_dispatcher_ms")]
    pub dispatcher_ms: u64,

    #[serde(default = "default_end_to_end_ms")]
    pub end_to_end_ms: u64,
}

fn default_observer_ms() -> u64 { 2_500 }
fn default_thinker_ms() -> u64 { 2_000 }
fn default_doer_ms() -> u64 { 1_500 }
fn default_dispatcher_ms() -> u64 { 1_200 }
fn default_end_to_end_ms() -> u64 { 5_000 }

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            observer_ms: default_observer_ms(),
            thinker_ms: default_thinker_ms(),
            doer_ms: default_doer_ms(),
            dispatcher_ms: default_dispatcher_ms(),
            end_to_end_ms: default_end_to_end_ms(),
        }
    }
}

impl SloConfig {
    /// Deadline for one stage (or one dispatcher attempt).
    pub const fn deadline(&self, stage: Stage) -> Duration {
        let ms = match stage {
            Stage::Observer => self.observer_ms,
            Stage::Thinker => self.thinker_ms,
            Stage::Doer => self.doer_ms,
            Stage::Dispatcher => self.dispatcher_ms,
        };
        Duration::from_millis(ms)
    }

    pub const fn end_to_end(&self) -> Duration {
        Duration::from_millis(self.end_to_end_ms)
    }
}

// ============================================================================
// Degradation Config
// ============================================================================

/// Thresholds below which the recommended action is capped at `ceiling`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_min_groundedness")]
    pub min_groundedness: f64,

    /// Highest-impact action allowed for an under-confident decision
    #[serde(default = "default_ceiling")]
    pub ceiling: ActionType,
}

fn default_min_confidence() -> f64 { 0.6 }
fn default_min_groundedness() -> f64 { 0.5 }
const fn default_ceiling() -> ActionType { ActionType::Alert }

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_groundedness: default_min_groundedness(),
            ceiling: default_ceiling(),
        }
    }
}

// ============================================================================
// Dispatcher Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Window in which a repeated dedup key is skipped as a duplicate
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// POST actions here instead of logging them to the console
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_max_retries() -> u32 { 2 }
fn default_base_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 2_000 }
fn default_dedup_window_secs() -> u64 { 20 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            dedup_window_secs: default_dedup_window_secs(),
            webhook_url: None,
        }
    }
}

// ============================================================================
// Escalation Config
// ============================================================================

/// Key space a rule deduplicates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    /// One open incident per (rule, stage)
    Stage,
    /// One open incident per (rule, clip)
    Clip,
    /// One open incident per rule
    Global,
}

/// `(kind, count within window) -> (incident severity, case priority)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    pub name: String,
    pub kind: AuditKind,
    #[serde(default = "default_rule_threshold")]
    pub threshold: u32,
    #[serde(default = "default_rule_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_rule_scope")]
    pub scope: DedupScope,
    /// Only count events from this stage
    #[serde(default)]
    pub stage: Option<Stage>,
    pub severity: IncidentSeverity,
    pub case_priority: CasePriority,
}

fn default_rule_threshold() -> u32 { 1 }
fn default_rule_window_secs() -> u64 { 60 }
const fn default_rule_scope() -> DedupScope { DedupScope::Stage }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// How long a dedup key suppresses further incidents
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Broadcast buffer between the audit log and the escalator
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// POST incidents and cases here instead of keeping them in memory
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_rules")]
    pub rules: Vec<EscalationRule>,
}

fn default_cooldown_secs() -> u64 { 300 }
fn default_channel_capacity() -> usize { 1_024 }

fn default_rules() -> Vec<EscalationRule> {
    vec![
        EscalationRule {
            name: "dispatcher_failure".to_string(),
            kind: AuditKind::ActionFailed,
            threshold: 1,
            window_secs: 60,
            scope: DedupScope::Stage,
            stage: Some(Stage::Dispatcher),
            severity: IncidentSeverity::Sev2,
            case_priority: CasePriority::P2,
        },
        EscalationRule {
            name: "stage_timeouts".to_string(),
            kind: AuditKind::StageTimeout,
            threshold: 3,
            window_secs: 60,
            scope: DedupScope::Stage,
            stage: None,
            severity: IncidentSeverity::Sev3,
            case_priority: CasePriority::P3,
        },
        EscalationRule {
            name: "security_block".to_string(),
            kind: AuditKind::SecurityBlock,
            threshold: 1,
            window_secs: 60,
            scope: DedupScope::Global,
            stage: None,
            severity: IncidentSeverity::Sev2,
            case_priority: CasePriority::P2,
        },
        EscalationRule {
            name: "tool_errors".to_string(),
            kind: AuditKind::ToolError,
            threshold: 3,
            window_secs: 60,
            scope: DedupScope::Stage,
            stage: None,
            severity: IncidentSeverity::Sev3,
            case_priority: CasePriority::P3,
        },
        EscalationRule {
            name: "parse_failures".to_string(),
            kind: AuditKind::ParseFail,
            threshold: 5,
            window_secs: 300,
            scope: DedupScope::Stage,
            stage: None,
            severity: IncidentSeverity::Sev4,
            case_priority: CasePriority::P4,
        },
    ]
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            channel_capacity: default_channel_capacity(),
            webhook_url: None,
            rules: default_rules(),
        }
    }
}

// ============================================================================
// Worker Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Clips processed concurrently
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Clips waiting before intake starts rejecting
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
}

fn default_pool_size() -> usize { 4 }
fn default_intake_capacity() -> usize { 64 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            intake_capacity: default_intake_capacity(),
        }
    }
}

// ============================================================================
// Audit Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Events the log accepts before appends fail with `StorageExhausted`
    #[serde(default = "default_audit_capacity")]
    pub capacity: u64,

    /// Sled directory; in-memory storage when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_audit_capacity() -> u64 { 1_000_000 }

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
            path: None,
        }
    }
}

// ============================================================================
// Server Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
