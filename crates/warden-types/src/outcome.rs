/// Dispatch outcomes, audit records, and external plugin health types.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PluginMode;
use crate::errors::{PolicyDenial, WardenError};
use crate::hooks::{HookPayload, HookType, PluginViolation};

/// Violation code used when a plugin returns `continue_processing = false`
/// without a violation of its own.
pub const PROCESSING_HALTED: &str = "PROCESSING_HALTED";

/// Violation code used when a plugin failure blocks the request.
pub const PLUGIN_FAILURE: &str = "plugin_failure";

// ============================================================
// Per-plugin Outcomes
// ============================================================

/// What happened to a single plugin during one hook dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// The plugin ran and returned a result (which may carry a violation).
    Success,
    /// The plugin was not called.
    Skipped,
    /// The plugin exceeded its deadline.
    Timeout,
    /// The plugin raised an error or returned an invalid result.
    Error,
    /// An external plugin could not be reached or spoke garbage.
    ProtocolError,
}

impl PluginStatus {
    /// Whether this status counts as a plugin failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PluginStatus::Timeout | PluginStatus::Error | PluginStatus::ProtocolError
        )
    }
}

/// Why a plugin was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    Unhealthy,
    ConditionMismatch,
}

/// Audit row for one plugin within one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginOutcomeRecord {
    pub plugin_name: String,
    pub priority: i32,
    pub mode: PluginMode,
    pub status: PluginStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Wall time spent waiting on the plugin.
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<PluginViolation>,
}

impl PluginOutcomeRecord {
    /// Record for a plugin that was not called.
    pub fn skipped(name: &str, priority: i32, mode: PluginMode, reason: SkipReason) -> Self {
        Self {
            plugin_name: name.to_string(),
            priority,
            mode,
            status: PluginStatus::Skipped,
            skip_reason: Some(reason),
            latency: Duration::ZERO,
            error: None,
            violation: None,
        }
    }
}

// ============================================================
// Dispatch Outcome
// ============================================================

/// Result of running one hook through every matching plugin.
#[derive(Debug, Clone)]
pub struct PluginExecutionOutcome {
    /// Payload after all applied modifications; the original payload (or the
    /// payload as of the blocking band) when blocked.
    pub final_payload: HookPayload,
    /// Whether the operation must be denied.
    pub blocked: bool,
    /// The blocking violation, present iff `blocked`.
    pub violation: Option<PluginViolation>,
    /// Every violation reported during the dispatch, blocking or not.
    pub violations: Vec<PluginViolation>,
    /// One record per registered plugin considered, in execution order.
    pub records: Vec<PluginOutcomeRecord>,
}

impl PluginExecutionOutcome {
    /// Outcome for a hook with no plugins to run.
    pub fn passthrough(payload: HookPayload) -> Self {
        Self {
            final_payload: payload,
            blocked: false,
            violation: None,
            violations: Vec::new(),
            records: Vec::new(),
        }
    }

    /// Caller-facing denial when blocked.
    pub fn denial(&self) -> Option<PolicyDenial> {
        if !self.blocked {
            return None;
        }
        self.violation.as_ref().map(PluginViolation::denial)
    }

    /// Convert into the final payload, or a short-circuit error when blocked.
    pub fn into_result(self) -> Result<HookPayload, WardenError> {
        match self.denial() {
            Some(denial) => Err(WardenError::EngineShortCircuit(denial)),
            None => Ok(self.final_payload),
        }
    }

    /// Look up the record for a plugin by name.
    pub fn record_for(&self, plugin_name: &str) -> Option<&PluginOutcomeRecord> {
        self.records.iter().find(|r| r.plugin_name == plugin_name)
    }
}

/// One entry per hook dispatch, written to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookAuditRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub hook: HookType,
    pub timestamp: DateTime<Utc>,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<PluginViolation>,
    pub plugins: Vec<PluginOutcomeRecord>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

// ============================================================
// External Plugin Health
// ============================================================

/// Health of an external plugin server as seen by its probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No probe has completed yet. Calls are allowed.
    Unknown,
    /// Last probe succeeded.
    Healthy,
    /// Failure threshold reached. Calls are skipped until a probe succeeds.
    Unhealthy,
}

/// Metrics snapshot from a health tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_successes: u64,
    pub total_failures: u64,
    /// Current run of failures without an intervening success.
    pub consecutive_failures: u32,
    /// Milliseconds spent in the current state.
    pub time_in_current_state_ms: u64,
    /// Number of transitions into `Unhealthy`.
    pub unhealthy_transitions: u64,
    pub current_state: HealthState,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
