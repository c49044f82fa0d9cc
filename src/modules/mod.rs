pub mod bola_detection;
pub mod context;
pub mod cost_protection;
pub mod credential_guard;
pub mod data_leak_prevention;
pub mod query_shield;
pub mod registry;

pub use bola_detection::BolaDetectionModule;
pub use context::ModuleContext;
pub use cost_protection::CostProtectionModule;
pub use credential_guard::CredentialGuardModule;
pub use data_leak_prevention::DataLeakPreventionModule;
pub use query_shield::QueryShieldModule;
pub use registry::ModuleRegistry;

use crate::model::{RequestEvent, ResponseEvent, ThreatVerdict};

/// A detection module. Each implementation focuses on one threat class and
/// plugs into the engine through the registry.
///
/// Lifecycle per request: `analyze_request` runs synchronously before the
/// downstream handler, `analyze_response` synchronously on egress, and
/// `analyze_batch` asynchronously with a drained buffer of recent events.
pub trait SecurityModule: Send + Sync {
    /// Unique identifier, also the configuration key under `modules.<id>`.
    fn id(&self) -> &str;

    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Priority order; lower runs first.
    fn order(&self) -> i32 {
        500
    }

    /// Synchronous per-request analysis. Must be fast and must not perform
    /// network I/O; decision-store lookups are the only blocking calls
    /// allowed here.
    fn analyze_request(&self, event: &RequestEvent, ctx: &ModuleContext) -> ThreatVerdict;

    /// Synchronous egress analysis. The returned event replaces the response
    /// for the modules that follow, so a module may rewrite the body.
    fn analyze_response(&self, response: ResponseEvent, _ctx: &ModuleContext) -> ResponseEvent {
        response
    }

    /// Asynchronous analysis over a batch of recent events. May consult the
    /// AI analyzer and take seconds.
    fn analyze_batch(&self, _events: &[RequestEvent], _ctx: &ModuleContext) -> Vec<ThreatVerdict> {
        Vec::new()
    }

    /// Whether the module participates at all, re-evaluated on each pass.
    fn is_enabled(&self, ctx: &ModuleContext) -> bool {
        ctx.config.is_module_enabled(self.id())
    }
}
