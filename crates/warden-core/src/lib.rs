/// Hook orchestration for the warden plugin engine.
///
/// Runs each hook through the registry's priority bands:
/// - **Dispatcher** (`dispatcher`): band fan-out and join, mode semantics, short-circuit
/// - **Merge** (`merge`): combining same-band payload modifications
/// - **Audit** (`audit`): sinks for the per-dispatch audit record
pub mod audit;
pub mod dispatcher;
mod merge;

pub use audit::{MemoryAuditSink, TracingAuditSink};
pub use dispatcher::HookDispatcher;
