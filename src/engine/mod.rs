pub mod executor;

pub use executor::BatchExecutor;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::model::{Action, RequestEvent, ResponseEvent, ThreatVerdict};
use crate::modules::{ModuleContext, ModuleRegistry};

const ENGINE_ID: &str = "engine";

/// Buffered events per async analysis batch. An engine constant, not module
/// configuration.
const BATCH_SIZE: usize = 20;

const ASYNC_WORKERS: usize = 2;
const ASYNC_QUEUE_CAPACITY: usize = 100;

/// Drives every request and response through the registered security
/// modules.
///
/// The synchronous path (`process_request`/`process_response`) runs on the
/// host's request thread and must stay fast; buffered events are analyzed in
/// batches on the executor's worker threads, where modules may consult the
/// AI analyzer.
pub struct SentinAIEngine {
    registry: ModuleRegistry,
    context: Arc<ModuleContext>,
    event_buffer: Mutex<Vec<RequestEvent>>,
    executor: BatchExecutor,
}

impl SentinAIEngine {
    pub fn new(registry: ModuleRegistry, context: Arc<ModuleContext>) -> Self {
        info!("engine started in {:?} mode", context.config.mode);
        Self {
            registry,
            context,
            event_buffer: Mutex::new(Vec::new()),
            executor: BatchExecutor::new(ASYNC_WORKERS, ASYNC_QUEUE_CAPACITY),
        }
    }

    /// Run an incoming request through the enabled inbound modules, in
    /// priority order. Returns the first enforceable verdict, or a safe one.
    ///
    /// A module failure never fails the request: panicking modules are
    /// logged and skipped, store faults read as "no data".
    pub fn process_request(&self, event: &RequestEvent) -> ThreatVerdict {
        let config = &self.context.config;
        if !config.enabled {
            return ThreatVerdict::safe(ENGINE_ID);
        }
        if self.is_excluded_path(&event.path) {
            return ThreatVerdict::safe(ENGINE_ID);
        }

        let store = &self.context.store;
        if store.is_blocked(&event.source_ip).unwrap_or(false) {
            return ThreatVerdict::block(ENGINE_ID, "IP is blacklisted", &event.source_ip, 0);
        }
        if let Some(user_id) = &event.user_id {
            // Verdict targets carry the bare user id while external tooling
            // writes `user:`-prefixed keys; honor both spellings.
            let prefixed = format!("user:{user_id}");
            if store.is_blocked(&prefixed).unwrap_or(false)
                || store.is_blocked(user_id).unwrap_or(false)
            {
                return ThreatVerdict::block(ENGINE_ID, "User is blacklisted", user_id, 0);
            }
        }

        for module in self.registry.enabled_modules(&self.context) {
            let verdict =
                match catch_unwind(AssertUnwindSafe(|| module.analyze_request(event, &self.context)))
                {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        error!("module '{}' panicked during request analysis", module.id());
                        continue;
                    }
                };

            if !verdict.is_threat() {
                continue;
            }

            if config.is_active_mode() {
                match verdict.recommended_action {
                    Action::Block | Action::Throttle | Action::Challenge => {
                        warn!(
                            "[{}] blocked {} {} from {}: {}",
                            module.id(),
                            event.method,
                            event.path,
                            event.source_ip,
                            verdict.reason
                        );
                        if verdict.should_block() {
                            self.write_block(&verdict);
                        }
                        return verdict;
                    }
                    _ => {
                        warn!(
                            "[{}] flagged {} {} from {}: {}",
                            module.id(),
                            event.method,
                            event.path,
                            event.source_ip,
                            verdict.reason
                        );
                    }
                }
            } else {
                warn!(
                    "[{}] would have blocked {} {} from {}: {}",
                    module.id(),
                    event.method,
                    event.path,
                    event.source_ip,
                    verdict.reason
                );
            }
        }

        self.buffer_event(event.clone());

        ThreatVerdict::safe(ENGINE_ID)
    }

    /// Run an outgoing response through the enabled modules in the same
    /// priority order; each module sees the output of the ones before it.
    pub fn process_response(&self, response: ResponseEvent) -> ResponseEvent {
        if !self.context.config.enabled {
            return response;
        }

        let mut current = response;
        for module in self.registry.enabled_modules(&self.context) {
            let snapshot = current.clone();
            match catch_unwind(AssertUnwindSafe(|| {
                module.analyze_response(snapshot, &self.context)
            })) {
                Ok(next) => current = next,
                Err(_) => {
                    error!("module '{}' panicked during response analysis", module.id());
                }
            }
        }
        current
    }

    /// Queue an event that already carries response metadata for batch
    /// analysis.
    pub fn submit_for_async_analysis(&self, event: RequestEvent) {
        if !self.context.config.enabled {
            return;
        }
        self.buffer_event(event);
    }

    /// Drain the buffer and analyze it inline. Mostly useful for tests and
    /// shutdown.
    pub fn flush_event_buffer(&self) {
        let batch = std::mem::take(&mut *self.event_buffer.lock());
        if !batch.is_empty() {
            run_batch_analysis(&self.registry, &self.context, &batch);
        }
    }

    fn buffer_event(&self, event: RequestEvent) {
        let batch = {
            let mut buffer = self.event_buffer.lock();
            buffer.push(event);
            if buffer.len() >= BATCH_SIZE {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            let registry = self.registry.clone();
            let context = self.context.clone();
            self.executor
                .execute(move || run_batch_analysis(&registry, &context, &batch));
        }
    }

    fn write_block(&self, verdict: &ThreatVerdict) {
        let Some(target) = &verdict.target_identifier else {
            return;
        };
        let duration =
            (verdict.block_duration_secs > 0).then(|| Duration::from_secs(verdict.block_duration_secs));
        if let Err(e) = self.context.store.block(target, &verdict.reason, duration) {
            error!("failed to record block for '{}': {}", target, e);
        }
    }

    fn is_excluded_path(&self, path: &str) -> bool {
        self.context
            .config
            .exclude_paths
            .iter()
            .any(|pattern| match pattern.strip_suffix("/**") {
                Some(prefix) => path.starts_with(prefix),
                None => pattern == path,
            })
    }
}

/// Batch analysis on a worker thread: every enabled module first, then the
/// AI analyzer over the same batch when one is configured.
fn run_batch_analysis(registry: &ModuleRegistry, context: &Arc<ModuleContext>, batch: &[RequestEvent]) {
    for module in registry.enabled_modules(context) {
        let verdicts = match catch_unwind(AssertUnwindSafe(|| {
            module.analyze_batch(batch, context)
        })) {
            Ok(verdicts) => verdicts,
            Err(_) => {
                error!("module '{}' panicked during batch analysis", module.id());
                continue;
            }
        };
        apply_batch_verdicts(context, module.id(), &verdicts);
    }

    if context.ai.is_available() {
        let verdicts = context.ai.analyze(batch, "Recent API traffic sample");
        apply_batch_verdicts(context, "ai-analyzer", &verdicts);
    }
}

fn apply_batch_verdicts(context: &Arc<ModuleContext>, module_id: &str, verdicts: &[ThreatVerdict]) {
    for verdict in verdicts {
        if !verdict.should_block() {
            continue;
        }
        let target = verdict.target_identifier.as_deref().unwrap_or("unknown");
        warn!("[{}] async block for '{}': {}", module_id, target, verdict.reason);

        if context.config.is_active_mode() {
            if let Some(target) = &verdict.target_identifier {
                let duration = (verdict.block_duration_secs > 0)
                    .then(|| Duration::from_secs(verdict.block_duration_secs));
                if let Err(e) = context.store.block(target, &verdict.reason, duration) {
                    error!("failed to record async block for '{}': {}", target, e);
                }
            }
        }
    }
}
