use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Local;
use log::{info, warn};
use parking_lot::Mutex;

use super::{ModuleContext, SecurityModule};
use crate::model::{RequestEvent, ThreatVerdict};

const ID: &str = "cost-protection";

const DEFAULT_DAILY_LIMIT: f64 = 50.0;
const DEFAULT_PER_USER_LIMIT: u64 = 100;
const DEFAULT_COST_PER_REQUEST: f64 = 0.003;
const DEFAULT_ALERT_THRESHOLD: f64 = 0.8;

const PER_USER_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const AI_PATH_MARKERS: &[&str] = &[
    "/chat",
    "/summarize",
    "/generate",
    "/ai/",
    "/completion",
    "/predict",
];

/// Protects the AI API budget: throttles once the estimated daily spend hits
/// the configured limit and caps per-user call counts.
///
/// The daily estimate is process-local; the per-user counter lives in the
/// decision store and is therefore shared across instances. Opt-in: the
/// module only runs when a `modules.cost-protection` section is configured.
pub struct CostProtectionModule {
    daily_request_count: AtomicU64,
    current_day: Mutex<String>,
}

impl CostProtectionModule {
    pub fn new() -> Self {
        Self {
            daily_request_count: AtomicU64::new(0),
            current_day: Mutex::new(Local::now().date_naive().to_string()),
        }
    }

    fn reset_if_new_day(&self) {
        let today = Local::now().date_naive().to_string();
        let mut day = self.current_day.lock();
        if *day != today {
            self.daily_request_count.store(0, Ordering::SeqCst);
            *day = today.clone();
            info!("daily AI budget reset for {}", today);
        }
    }
}

impl Default for CostProtectionModule {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ai_endpoint(path: &str) -> bool {
    let lower = path.to_lowercase();
    AI_PATH_MARKERS.iter().any(|m| lower.contains(m))
}

impl SecurityModule for CostProtectionModule {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Cost Protection"
    }

    fn order(&self) -> i32 {
        900
    }

    fn is_enabled(&self, ctx: &ModuleContext) -> bool {
        ctx.config.has_module_config(ID) && ctx.config.is_module_enabled(ID)
    }

    fn analyze_request(&self, event: &RequestEvent, ctx: &ModuleContext) -> ThreatVerdict {
        if !is_ai_endpoint(&event.path) {
            return ThreatVerdict::safe(ID);
        }

        self.reset_if_new_day();

        let daily_limit = ctx
            .config
            .module_option_f64(ID, "daily-limit", DEFAULT_DAILY_LIMIT);
        let cost_per_request =
            ctx.config
                .module_option_f64(ID, "cost-per-request", DEFAULT_COST_PER_REQUEST);
        let estimated_spend =
            self.daily_request_count.load(Ordering::SeqCst) as f64 * cost_per_request;

        if estimated_spend >= daily_limit {
            warn!(
                "daily AI budget exceeded: ${:.2}/${:.0}",
                estimated_spend, daily_limit
            );
            return ThreatVerdict::throttle(
                ID,
                format!(
                    "Daily AI budget exceeded (${:.2}/${:.0})",
                    estimated_spend, daily_limit
                ),
                &event.source_ip,
            );
        }

        let alert_threshold =
            ctx.config
                .module_option_f64(ID, "alert-threshold", DEFAULT_ALERT_THRESHOLD);
        if estimated_spend >= daily_limit * alert_threshold {
            warn!(
                "AI budget alert: ${:.2}/${:.0} ({:.0}%)",
                estimated_spend,
                daily_limit,
                estimated_spend / daily_limit * 100.0
            );
        }

        if let Some(user_id) = &event.user_id {
            let per_user_limit =
                ctx.config
                    .module_option_u64(ID, "per-user-limit", DEFAULT_PER_USER_LIMIT);
            let user_count = ctx
                .store
                .increment_counter(&format!("cp:user:{user_id}"), PER_USER_WINDOW)
                .unwrap_or(0);
            if user_count > per_user_limit {
                warn!(
                    "user '{}' exceeded daily AI limit: {}/{}",
                    user_id, user_count, per_user_limit
                );
                return ThreatVerdict::throttle(
                    ID,
                    format!("User daily AI limit exceeded ({user_count}/{per_user_limit})"),
                    format!("user:{user_id}"),
                );
            }
        }

        self.daily_request_count.fetch_add(1, Ordering::SeqCst);
        ThreatVerdict::safe(ID)
    }
}
