/// Trait contracts for the warden plugin engine.
///
/// Plugins and audit sinks are coded against these interfaces, so the
/// dispatcher never knows whether a plugin runs in-process or behind an
/// external proxy.
use async_trait::async_trait;

use crate::context::PluginCallContext;
use crate::errors::WardenError;
use crate::hooks::{HookPayload, HookType, PluginResult};
use crate::outcome::{HealthState, HookAuditRecord};

// ============================================================
// Plugin Contract
// ============================================================

/// A policy plugin invoked at one or more hook points.
///
/// Implementations must be safe to call concurrently: the dispatcher runs
/// all plugins of a band at the same time and may call the same instance
/// from several requests.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// One-time setup, awaited while the registry is built.
    ///
    /// An error aborts engine startup.
    async fn initialize(&self) -> Result<(), WardenError> {
        Ok(())
    }

    /// Handle one hook call.
    ///
    /// `payload` is always the variant belonging to `hook`. A returned
    /// `modified_payload` must be the same variant.
    async fn invoke(
        &self,
        hook: HookType,
        payload: HookPayload,
        ctx: &mut PluginCallContext,
    ) -> Result<PluginResult, WardenError>;

    /// Release resources at engine shutdown.
    async fn shutdown(&self) -> Result<(), WardenError> {
        Ok(())
    }

    /// Liveness as tracked by the plugin itself.
    ///
    /// `None` for in-process plugins, which are always callable.
    fn health(&self) -> Option<HealthState> {
        None
    }

    /// Whether the dispatcher should call the plugin now. Unhealthy plugins
    /// are skipped unless they allow a trial call.
    fn accepts_calls(&self) -> bool {
        self.health() != Some(HealthState::Unhealthy)
    }

    /// Notified once per timed-out call, whether the dispatcher's deadline
    /// fired or the plugin itself returned `PluginTimeout`.
    fn record_timeout(&self) {}
}

// ============================================================
// Audit Contract
// ============================================================

/// Destination for per-dispatch audit records, owned by the host gateway.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist or forward one record.
    ///
    /// Failures are logged by the dispatcher and never change the outcome.
    async fn record(&self, record: HookAuditRecord) -> Result<(), WardenError>;
}
