use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{ModuleContext, SecurityModule};
use crate::model::{RequestEvent, ThreatVerdict};

const ID: &str = "bola-detection";

static NUMERIC_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"/api/\w+/([0-9]+)").unwrap());
static UUID_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/api/\w+/([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})").unwrap()
});

const TRACKING_WINDOW: Duration = Duration::from_secs(10 * 60);
const BLOCK_DURATION: Duration = Duration::from_secs(30 * 60);
const REPEAT_BLOCK_DURATION: Duration = Duration::from_secs(60 * 60);

const DEFAULT_UNIQUE_ID_THRESHOLD: u64 = 15;
const DEFAULT_SEQUENTIAL_THRESHOLD: u64 = 5;

/// How many distinct resource ids inside one async batch flag a user.
const BATCH_UNIQUE_ID_LIMIT: usize = 10;

/// Detects Broken Object Level Authorization probing: one authenticated user
/// walking other users' objects by manipulating resource identifiers.
///
/// Two signals, both tracked in the decision store so detection follows the
/// user across instances: how many distinct ids the user touched inside the
/// tracking window, and runs of sequential numeric ids (1, 2, 3, ...).
pub struct BolaDetectionModule;

impl BolaDetectionModule {
    pub fn new() -> Self {
        Self
    }

    /// Sequential-access tracking. Returns the current run length; a
    /// non-adjacent id resets the run to zero.
    fn track_sequential_access(&self, user_id: &str, current: i64, ctx: &ModuleContext) -> u64 {
        let last_key = format!("bola:seq:{user_id}:last");
        let count_key = format!("bola:seq:{user_id}:count");

        let last = ctx
            .store
            .get(&last_key)
            .ok()
            .flatten()
            .and_then(|value| value.parse::<i64>().ok());
        let adjacent = matches!(last, Some(last) if current == last + 1 || current == last - 1);

        if let Err(e) = ctx
            .store
            .put(&last_key, &current.to_string(), Some(TRACKING_WINDOW))
        {
            warn!("failed to record last resource id for '{}': {}", user_id, e);
        }

        if adjacent {
            ctx.store
                .increment_counter(&count_key, TRACKING_WINDOW)
                .unwrap_or(0)
        } else {
            if let Err(e) = ctx.store.clear_counter(&count_key) {
                warn!("failed to reset sequential count for '{}': {}", user_id, e);
            }
            0
        }
    }
}

impl Default for BolaDetectionModule {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_resource_id(path: &str) -> Option<&str> {
    NUMERIC_ID_PATTERN
        .captures(path)
        .or_else(|| UUID_ID_PATTERN.captures(path))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

impl SecurityModule for BolaDetectionModule {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "BOLA Detection"
    }

    fn order(&self) -> i32 {
        300
    }

    fn analyze_request(&self, event: &RequestEvent, ctx: &ModuleContext) -> ThreatVerdict {
        // Only authenticated access to an identified resource is in scope.
        let Some(user_id) = &event.user_id else {
            return ThreatVerdict::safe(ID);
        };
        let Some(resource_id) = extract_resource_id(&event.path) else {
            return ThreatVerdict::safe(ID);
        };

        let user_key = format!("bola:user:{user_id}");
        if ctx.store.is_blocked(&user_key).unwrap_or(false) {
            return ThreatVerdict::block(
                ID,
                "User blocked for BOLA attack",
                user_id,
                REPEAT_BLOCK_DURATION.as_secs(),
            );
        }

        // Distinct-id tracking: the per-id counter doubles as a TTL presence
        // marker, and only its first insert bumps the distinct total.
        let ids_key = format!("{user_key}:ids");
        let first_visit = ctx
            .store
            .increment_counter(&format!("{ids_key}:{resource_id}"), TRACKING_WINDOW)
            .map(|count| count == 1)
            .unwrap_or(false);
        let total_key = format!("{ids_key}:total");
        let total_unique = if first_visit {
            ctx.store
                .increment_counter(&total_key, TRACKING_WINDOW)
                .unwrap_or(0)
        } else {
            ctx.store.get_counter(&total_key).unwrap_or(0)
        };

        let unique_threshold =
            ctx.config
                .module_option_u64(ID, "unique-id-threshold", DEFAULT_UNIQUE_ID_THRESHOLD);
        if total_unique > unique_threshold {
            warn!(
                "user '{}' accessed {} unique resource ids in the tracking window",
                user_id, total_unique
            );
            return ThreatVerdict::block(
                ID,
                format!(
                    "BOLA: user accessed {} unique resource IDs within the tracking window",
                    total_unique
                ),
                user_id,
                BLOCK_DURATION.as_secs(),
            );
        }

        if let Ok(current) = resource_id.parse::<i64>() {
            let run = self.track_sequential_access(user_id, current, ctx);
            let sequential_threshold = ctx.config.module_option_u64(
                ID,
                "sequential-threshold",
                DEFAULT_SEQUENTIAL_THRESHOLD,
            );
            if run >= sequential_threshold {
                warn!(
                    "user '{}' accessing sequential ids: {} consecutive",
                    user_id, run
                );
                return ThreatVerdict::block(
                    ID,
                    format!(
                        "BOLA: Sequential ID enumeration detected ({} consecutive IDs)",
                        run
                    ),
                    user_id,
                    BLOCK_DURATION.as_secs(),
                );
            }
        }

        ThreatVerdict::safe(ID)
    }

    fn analyze_batch(&self, events: &[RequestEvent], _ctx: &ModuleContext) -> Vec<ThreatVerdict> {
        let mut ids_by_user: HashMap<&str, HashSet<&str>> = HashMap::new();
        for event in events {
            let (Some(user_id), Some(resource_id)) =
                (event.user_id.as_deref(), extract_resource_id(&event.path))
            else {
                continue;
            };
            ids_by_user.entry(user_id).or_default().insert(resource_id);
        }

        ids_by_user
            .into_iter()
            .filter(|(_, ids)| ids.len() > BATCH_UNIQUE_ID_LIMIT)
            .map(|(user_id, ids)| {
                ThreatVerdict::suspicious(
                    ID,
                    format!(
                        "Batch analysis: user '{}' accessed {} unique IDs",
                        user_id,
                        ids.len()
                    ),
                    user_id,
                )
            })
            .collect()
    }
}
