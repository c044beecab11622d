//! Audit sinks for per-dispatch records.
//!
//! The host gateway normally supplies its own [`AuditSink`]; these two cover
//! log-only deployments and tests.

use async_trait::async_trait;
use tokio::sync::Mutex;

use warden_types::errors::WardenError;
use warden_types::outcome::HookAuditRecord;
use warden_types::traits::AuditSink;

/// Emits one structured `tracing` event per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: HookAuditRecord) -> Result<(), WardenError> {
        let plugins = serde_json::to_string(&record.plugins)
            .map_err(|e| WardenError::Audit(format!("failed to encode plugin records: {e}")))?;
        let failures = record.plugins.iter().filter(|p| p.status.is_failure()).count();
        tracing::info!(
            target: "warden::audit",
            audit_id = %record.id,
            request_id = %record.request_id,
            hook = %record.hook,
            blocked = record.blocked,
            violation_code = record.violation.as_ref().map(|v| v.code.as_str()),
            failures,
            duration_ms = record.duration.as_millis() as u64,
            plugins = %plugins,
            "hook dispatched"
        );
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<HookAuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records, oldest first.
    pub async fn records(&self) -> Vec<HookAuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: HookAuditRecord) -> Result<(), WardenError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;
    use warden_types::config::PluginMode;
    use warden_types::hooks::HookType;
    use warden_types::outcome::{PluginOutcomeRecord, PluginStatus, SkipReason};

    fn record(blocked: bool) -> HookAuditRecord {
        HookAuditRecord {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            hook: HookType::ToolPreInvoke,
            timestamp: Utc::now(),
            blocked,
            violation: None,
            plugins: Vec::new(),
            duration: Duration::from_millis(3),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        assert!(sink.records().await.is_empty());
        sink.record(record(false)).await.unwrap();
        sink.record(record(true)).await.unwrap();

        let records = sink.records().await;
        assert_eq!(records.len(), 2);
        assert!(!records[0].blocked);
        assert!(records[1].blocked);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_records() {
        TracingAuditSink.record(record(true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_failed_plugin_rows() {
        let mut failed =
            PluginOutcomeRecord::skipped("remote", 5, PluginMode::Enforce, SkipReason::Unhealthy);
        failed.status = PluginStatus::Timeout;
        failed.error = Some("deadline exceeded".to_string());

        let mut rec = record(false);
        rec.plugins = vec![
            failed,
            PluginOutcomeRecord::skipped("off", 1, PluginMode::Disabled, SkipReason::Disabled),
        ];
        TracingAuditSink.record(rec).await.unwrap();
    }
}
