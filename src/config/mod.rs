//! Pipeline Configuration Module
//!
//! Stage deadlines, degradation thresholds, retry policy, escalation rules,
//! and worker sizing, loaded from TOML so operators can tune them without a
//! rebuild.
//!
//! ## Loading Order
//!
//! 1. `STAGEWARDEN_CONFIG` environment variable (path to TOML file)
//! 2. `stagewarden.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(PipelineConfig::load());
//!
//! // Anywhere in the binary:
//! let deadline = config::get().slo.end_to_end();
//! ```
//!
//! Library components never reach for the global. They receive the config
//! sections they need at construction.

mod pipeline_config;
pub mod defaults;
pub mod validation;

pub use pipeline_config::*;

use std::sync::OnceLock;

/// Global pipeline configuration, initialized once at startup.
static PIPELINE_CONFIG: OnceLock<PipelineConfig> = OnceLock::new();

/// Initialize the global pipeline configuration.
///
/// Subsequent calls are ignored with a warning.
pub fn init(config: PipelineConfig) {
    if PIPELINE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global pipeline configuration.
///
/// Falls back to built-in defaults if `init()` was never called.
pub fn get() -> &'static PipelineConfig {
    PIPELINE_CONFIG.get_or_init(|| {
        tracing::warn!("config::get() called before config::init(), using defaults");
        PipelineConfig::default()
    })
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    PIPELINE_CONFIG.get().is_some()
}
