//! Hook dispatcher: runs one hook through every registered plugin.
//!
//! Bands run strictly in ascending priority. Within a band every eligible
//! plugin is launched against the same band-entry payload, each on its own
//! task with its own deadline, and the band is joined before anything is
//! applied:
//! 1. Skip disabled, unhealthy, and non-matching plugins (recorded, not called)
//! 2. Launch the rest (concurrently unless `parallel_execution_within_band` is off)
//! 3. Classify each call and apply the plugin's mode
//! 4. On a block, stop: return the band-entry payload with the violation
//! 5. Otherwise merge payload changes, metadata, and context writes in
//!    registration order, then move to the next band
//!
//! Calls that outlive their deadline are detached, not aborted; their late
//! results are dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_plugins::matcher::{resolve_scope, MatchIdentity};
use warden_plugins::registry::{ExecutionBand, PluginRegistry, RegisteredPlugin};
use warden_types::config::PluginMode;
use warden_types::context::{PluginCallContext, PluginContext};
use warden_types::errors::WardenError;
use warden_types::hooks::{HookPayload, HookType, PluginResult, PluginViolation};
use warden_types::outcome::{
    HookAuditRecord, PluginExecutionOutcome, PluginOutcomeRecord, PluginStatus, SkipReason,
    PLUGIN_FAILURE, PROCESSING_HALTED,
};
use warden_types::traits::{AuditSink, Plugin};

use crate::merge::merge_band_payloads;

/// Entry point the gateway calls once per hook.
///
/// Cheap to share: holds only the registry and an optional audit sink, and
/// keeps no per-request state of its own.
#[derive(Clone)]
pub struct HookDispatcher {
    registry: Arc<PluginRegistry>,
    audit: Option<Arc<dyn AuditSink>>,
}

/// One launched plugin call, before it runs.
struct PendingCall {
    plugin: Arc<RegisteredPlugin>,
    instance: Arc<dyn Plugin>,
    payload: HookPayload,
    ctx: PluginCallContext,
    timeout: Duration,
}

enum CallOutcome {
    Completed(PluginResult, PluginCallContext),
    Failed { status: PluginStatus, message: String },
}

struct FinishedCall {
    plugin: Arc<RegisteredPlugin>,
    outcome: CallOutcome,
    latency: Duration,
}

/// A non-blocking plugin's contribution, folded into the request context
/// once the band is known not to block.
struct Contribution {
    plugin_name: String,
    metadata: Map<String, Value>,
    ctx: Option<PluginCallContext>,
}

/// The decision that stops a dispatch.
struct Block {
    plugin_name: String,
    violation: PluginViolation,
    metadata: Map<String, Value>,
}

impl HookDispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            audit: None,
        }
    }

    /// Write one [`HookAuditRecord`] per dispatch to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Run `hook` over `payload`.
    ///
    /// Plugin failures, timeouts, and violations are all contained in the
    /// returned outcome. The only error is a payload of the wrong variant for
    /// `hook`, which is a caller bug.
    pub async fn invoke(
        &self,
        hook: HookType,
        payload: HookPayload,
        ctx: &mut PluginContext,
    ) -> Result<PluginExecutionOutcome, WardenError> {
        if payload.hook_type() != hook {
            return Err(WardenError::Internal(format!(
                "{} payload dispatched to hook {hook}",
                payload.hook_type()
            )));
        }

        let started = Instant::now();
        let mut outcome = PluginExecutionOutcome::passthrough(payload);

        for band in self.registry.bands_for(hook) {
            let calls =
                self.prepare_band(hook, band, &outcome.final_payload, ctx, &mut outcome.records);
            if calls.is_empty() {
                continue;
            }

            let finished = self.execute(hook, calls).await;
            if let Some(block) = self.apply_band(hook, finished, ctx, &mut outcome) {
                info!(
                    plugin = %block.plugin_name,
                    hook = %hook,
                    request_id = %ctx.request_id,
                    code = %block.violation.code,
                    priority = band.priority,
                    "request blocked"
                );
                ctx.record_metadata(&block.plugin_name, hook, block.metadata);
                outcome.blocked = true;
                outcome.violation = Some(block.violation);
                break;
            }
        }

        self.write_audit(hook, ctx, &outcome, started.elapsed()).await;
        Ok(outcome)
    }

    // ============================================================
    // Band Execution
    // ============================================================

    /// Record skips and build the calls for every eligible band member.
    fn prepare_band(
        &self,
        hook: HookType,
        band: &ExecutionBand,
        payload: &HookPayload,
        ctx: &PluginContext,
        records: &mut Vec<PluginOutcomeRecord>,
    ) -> Vec<PendingCall> {
        let identity = MatchIdentity::new(&ctx.identity, payload);
        let settings = self.registry.settings();
        let mut calls = Vec::with_capacity(band.members.len());

        for plugin in &band.members {
            let skip = |reason| {
                PluginOutcomeRecord::skipped(plugin.name(), plugin.priority(), plugin.mode(), reason)
            };

            let instance = match &plugin.instance {
                Some(instance) if plugin.mode() != PluginMode::Disabled => instance,
                _ => {
                    records.push(skip(SkipReason::Disabled));
                    continue;
                }
            };
            if !instance.accepts_calls() {
                debug!(plugin = %plugin.name(), hook = %hook, "plugin unhealthy, skipped");
                records.push(skip(SkipReason::Unhealthy));
                continue;
            }
            let Some(scope) = resolve_scope(&plugin.config, &identity) else {
                records.push(skip(SkipReason::ConditionMismatch));
                continue;
            };

            calls.push(PendingCall {
                plugin: plugin.clone(),
                instance: instance.clone(),
                payload: payload.clone(),
                ctx: ctx.call_context(plugin.name(), hook, scope),
                timeout: plugin.config.timeout(settings),
            });
        }
        calls
    }

    /// Run the calls and return their results in registration order.
    async fn execute(&self, hook: HookType, calls: Vec<PendingCall>) -> Vec<FinishedCall> {
        if self.registry.settings().parallel_execution_within_band {
            return join_all(calls.into_iter().map(|call| run_call(hook, call))).await;
        }
        let mut finished = Vec::with_capacity(calls.len());
        for call in calls {
            finished.push(run_call(hook, call).await);
        }
        finished
    }

    /// Apply mode semantics to a joined band.
    ///
    /// Returns the first blocking decision in registration order. When the
    /// band blocks, no payload change or context write from it is applied.
    fn apply_band(
        &self,
        hook: HookType,
        finished: Vec<FinishedCall>,
        ctx: &mut PluginContext,
        outcome: &mut PluginExecutionOutcome,
    ) -> Option<Block> {
        let fail_on_error = self.registry.settings().fail_on_plugin_error;
        let mut block: Option<Block> = None;
        let mut modified = Vec::new();
        let mut contributions = Vec::new();

        for call in finished {
            let plugin = &call.plugin;
            let name = plugin.name().to_string();
            let mut record = PluginOutcomeRecord {
                plugin_name: name.clone(),
                priority: plugin.priority(),
                mode: plugin.mode(),
                status: PluginStatus::Success,
                skip_reason: None,
                latency: call.latency,
                error: None,
                violation: None,
            };

            match call.outcome {
                CallOutcome::Completed(result, call_ctx) => {
                    let PluginResult {
                        continue_processing,
                        modified_payload,
                        violation,
                        metadata,
                    } = result;
                    let violation = violation
                        .or_else(|| (!continue_processing).then(processing_halted));

                    if let Some(mut violation) = violation {
                        violation.plugin_name = Some(name.clone());
                        record.violation = Some(violation.clone());
                        outcome.violations.push(violation.clone());

                        if plugin.mode().blocks_on_violation() {
                            if block.is_none() {
                                block = Some(Block {
                                    plugin_name: name,
                                    violation,
                                    metadata,
                                });
                            }
                            outcome.records.push(record);
                            continue;
                        }
                        warn!(
                            plugin = %name,
                            hook = %hook,
                            request_id = %ctx.request_id,
                            code = %violation.code,
                            reason = %violation.reason,
                            "violation in permissive mode, continuing"
                        );
                    }

                    modified.extend(modified_payload);
                    contributions.push(Contribution {
                        plugin_name: name,
                        metadata,
                        ctx: Some(call_ctx),
                    });
                }
                CallOutcome::Failed { status, message } => {
                    record.status = status;
                    record.error = Some(message.clone());

                    if plugin.mode() == PluginMode::Enforce && fail_on_error {
                        warn!(
                            plugin = %name,
                            hook = %hook,
                            request_id = %ctx.request_id,
                            status = ?status,
                            error = %message,
                            "plugin failure blocks request"
                        );
                        let mut violation = PluginViolation::new(
                            PLUGIN_FAILURE,
                            format!("plugin '{name}' failed"),
                            message,
                        )
                        .with_detail("status", json!(status));
                        violation.plugin_name = Some(name.clone());
                        record.violation = Some(violation.clone());
                        outcome.violations.push(violation.clone());
                        if block.is_none() {
                            block = Some(Block {
                                plugin_name: name,
                                violation,
                                metadata: Map::new(),
                            });
                        }
                    } else {
                        warn!(
                            plugin = %name,
                            hook = %hook,
                            request_id = %ctx.request_id,
                            status = ?status,
                            error = %message,
                            "plugin failure ignored"
                        );
                        let mut metadata = Map::new();
                        metadata.insert(
                            "plugin_error".to_string(),
                            json!({ "status": status, "message": message }),
                        );
                        contributions.push(Contribution {
                            plugin_name: name,
                            metadata,
                            ctx: None,
                        });
                    }
                }
            }
            outcome.records.push(record);
        }

        if block.is_some() {
            return block;
        }

        outcome.final_payload = merge_band_payloads(&outcome.final_payload, modified);
        for contribution in contributions {
            ctx.record_metadata(&contribution.plugin_name, hook, contribution.metadata);
            if let Some(call_ctx) = contribution.ctx {
                ctx.absorb(call_ctx);
            }
        }
        None
    }

    async fn write_audit(
        &self,
        hook: HookType,
        ctx: &PluginContext,
        outcome: &PluginExecutionOutcome,
        duration: Duration,
    ) {
        let Some(sink) = &self.audit else {
            return;
        };
        let record = HookAuditRecord {
            id: Uuid::new_v4(),
            request_id: ctx.request_id,
            hook,
            timestamp: Utc::now(),
            blocked: outcome.blocked,
            violation: outcome.violation.clone(),
            plugins: outcome.records.clone(),
            duration,
        };
        if let Err(e) = sink.record(record).await {
            error!(
                hook = %hook,
                request_id = %ctx.request_id,
                error = %e,
                "failed to write audit record"
            );
        }
    }
}

/// Run one plugin call on its own task under its deadline.
async fn run_call(hook: HookType, call: PendingCall) -> FinishedCall {
    let PendingCall {
        plugin,
        instance,
        payload,
        ctx,
        timeout,
    } = call;

    let started = Instant::now();
    let task_instance = instance.clone();
    let handle = tokio::spawn(async move {
        let mut ctx = ctx;
        let result = task_instance.invoke(hook, payload, &mut ctx).await;
        (result, ctx)
    });

    // Dropping the handle on timeout detaches the task; it is never aborted.
    let outcome = match tokio::time::timeout(timeout, handle).await {
        Err(_) => {
            instance.record_timeout();
            CallOutcome::Failed {
                status: PluginStatus::Timeout,
                message: format!("timed out after {}ms", timeout.as_millis()),
            }
        }
        Ok(Err(join_error)) => CallOutcome::Failed {
            status: PluginStatus::Error,
            message: format!("plugin task failed: {join_error}"),
        },
        Ok(Ok((Err(e), _))) => {
            let status = classify_error(&e);
            if status == PluginStatus::Timeout {
                instance.record_timeout();
            }
            CallOutcome::Failed {
                status,
                message: e.to_string(),
            }
        }
        Ok(Ok((Ok(result), ctx))) => match &result.modified_payload {
            Some(modified) if modified.hook_type() != hook => CallOutcome::Failed {
                status: PluginStatus::Error,
                message: format!("returned a {} payload for hook {hook}", modified.hook_type()),
            },
            _ => CallOutcome::Completed(result, ctx),
        },
    };

    let latency = started.elapsed();
    debug!(
        plugin = %plugin.name(),
        hook = %hook,
        latency_ms = latency.as_millis() as u64,
        "plugin call finished"
    );
    FinishedCall {
        plugin,
        outcome,
        latency,
    }
}

fn classify_error(error: &WardenError) -> PluginStatus {
    match error {
        WardenError::PluginProtocol(_) => PluginStatus::ProtocolError,
        WardenError::PluginTimeout(_) => PluginStatus::Timeout,
        _ => PluginStatus::Error,
    }
}

fn processing_halted() -> PluginViolation {
    PluginViolation::new(
        PROCESSING_HALTED,
        "processing halted by plugin",
        "plugin returned continue_processing = false without a violation",
    )
}
