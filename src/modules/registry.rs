use std::sync::Arc;

use log::info;

use super::{
    BolaDetectionModule, CostProtectionModule, CredentialGuardModule, DataLeakPreventionModule,
    ModuleContext, QueryShieldModule, SecurityModule,
};

/// Ordered collection of security modules. Sorting happens once at
/// construction and is stable, so modules with equal order keep their
/// registration order; iteration is always ascending by priority.
#[derive(Clone)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn SecurityModule>>,
}

impl ModuleRegistry {
    pub fn new(mut modules: Vec<Arc<dyn SecurityModule>>) -> Self {
        modules.sort_by_key(|module| module.order());
        info!(
            "registered {} security modules: {}",
            modules.len(),
            modules
                .iter()
                .map(|m| format!("{}(order={})", m.id(), m.order()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self { modules }
    }

    /// The five bundled detection modules in their default priority order.
    pub fn bundled() -> Self {
        Self::new(vec![
            Arc::new(CredentialGuardModule::new()),
            Arc::new(QueryShieldModule::new()),
            Arc::new(BolaDetectionModule::new()),
            Arc::new(DataLeakPreventionModule::new()),
            Arc::new(CostProtectionModule::new()),
        ])
    }

    pub fn modules(&self) -> &[Arc<dyn SecurityModule>] {
        &self.modules
    }

    pub fn module(&self, id: &str) -> Option<&Arc<dyn SecurityModule>> {
        self.modules.iter().find(|m| m.id() == id)
    }

    pub fn has_module(&self, id: &str) -> bool {
        self.module(id).is_some()
    }

    /// The enabled subset, re-evaluated against configuration on each call.
    pub fn enabled_modules(&self, ctx: &ModuleContext) -> Vec<Arc<dyn SecurityModule>> {
        self.modules
            .iter()
            .filter(|m| m.is_enabled(ctx))
            .cloned()
            .collect()
    }
}
