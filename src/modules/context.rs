use std::sync::Arc;

use crate::ai::AiAnalyzer;
use crate::config::SentinAIConfig;
use crate::store::DecisionStore;

/// Shared handle passed to every module during analysis. Built once at
/// composition time and read-only afterwards; it carries no per-request
/// state.
pub struct ModuleContext {
    /// Blocklist, rate counters and keyed data, shared across the fleet.
    pub store: Arc<dyn DecisionStore>,
    /// Optional AI-assisted analysis, for batch paths only.
    pub ai: Arc<AiAnalyzer>,
    pub config: Arc<SentinAIConfig>,
}

impl ModuleContext {
    pub fn new(
        store: Arc<dyn DecisionStore>,
        ai: Arc<AiAnalyzer>,
        config: Arc<SentinAIConfig>,
    ) -> Self {
        Self { store, ai, config }
    }
}
