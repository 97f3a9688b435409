use crate::retry::RetryPolicy;
use conductor_core::{ConductorError, ConductorResult, ErrorKind};
use conductor_security::DEFAULT_AUDIT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What the engine does after a stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageFailurePolicy {
    /// Stop; later stages stay pending and the workflow fails.
    #[default]
    Halt,
    /// Run every remaining stage; the workflow fails if any stage failed.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Ring buffer size; the oldest entry is evicted once full.
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
        }
    }
}

/// Configuration for one [`ExecutionEngine`](crate::ExecutionEngine).
///
/// ```toml
/// max_concurrency = 4
/// default_max_retries = 2
/// stage_failure_policy = "continue"
///
/// [retry]
/// base_delay_ms = 250
/// cap_delay_ms = 10000
/// retryable_kinds = ["resource", "timeout"]
///
/// [audit]
/// capacity = 500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum agent invocations in flight across all workflows.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub audit: AuditConfig,
    /// Applied to tasks whose submission omits `max_retries`.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub stage_failure_policy: StageFailurePolicy,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: RetryPolicy::default(),
            audit: AuditConfig::default(),
            default_max_retries: default_max_retries(),
            stage_failure_policy: StageFailurePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> ConductorResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| ConductorError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConductorError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.audit.capacity == 0 {
            return Err(ConductorError::Config(
                "audit.capacity must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.cap_delay_ms {
            return Err(ConductorError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.cap_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.cap_delay_ms
            )));
        }
        for kind in [ErrorKind::Validation, ErrorKind::NoCapableAgent] {
            if self.retry.retryable_kinds.contains(&kind) {
                return Err(ConductorError::Config(format!(
                    "retry.retryable_kinds must not contain '{kind}'"
                )));
            }
        }
        Ok(())
    }
}
