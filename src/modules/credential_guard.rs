use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{debug, warn};
use sha2::{Digest, Sha256};

use super::{ModuleContext, SecurityModule};
use crate::model::{RequestEvent, ResponseEvent, ThreatVerdict};

const ID: &str = "credential-guard";

const FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);
const BLOCK_DURATION: Duration = Duration::from_secs(30 * 60);

const DEFAULT_PER_USERNAME_FAILURES: u64 = 10;
const DEFAULT_PER_FINGERPRINT_FAILURES: u64 = 20;
const DEFAULT_GLOBAL_FAILURE_SPIKE: u64 = 500;

const LOGIN_PATH_MARKERS: &[&str] = &["/login", "/auth", "/signin", "/token", "/authenticate"];

/// Detects brute-force logins and credential stuffing.
///
/// The synchronous path only answers "is this client fingerprint already
/// blocked"; the actual counting happens on the response path (failed login
/// statuses) and in batch analysis, which issues the blocks.
pub struct CredentialGuardModule;

impl CredentialGuardModule {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CredentialGuardModule {
    fn default() -> Self {
        Self::new()
    }
}

fn is_login_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    LOGIN_PATH_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_login_attempt(event: &RequestEvent) -> bool {
    event.method.eq_ignore_ascii_case("POST") && is_login_path(&event.path)
}

fn is_login_failure(status: u16) -> bool {
    matches!(status, 400 | 401 | 403)
}

/// Stable client fingerprint over user agent and accept headers, so a
/// stuffing attacker rotating IPs still resolves to the same key.
fn fingerprint(event: &RequestEvent) -> String {
    let ua = event.user_agent.as_deref().unwrap_or("");
    let accept_language = event
        .headers
        .get("accept-language")
        .map(String::as_str)
        .unwrap_or("");
    let accept = event.headers.get("accept").map(String::as_str).unwrap_or("");

    let digest = Sha256::digest(format!("{ua}|{accept_language}|{accept}").as_bytes());
    digest[..8].iter().fold(String::new(), |mut out, byte| {
        out.push_str(&format!("{byte:02x}"));
        out
    })
}

impl SecurityModule for CredentialGuardModule {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Credential Guard"
    }

    fn order(&self) -> i32 {
        100
    }

    fn analyze_request(&self, event: &RequestEvent, ctx: &ModuleContext) -> ThreatVerdict {
        if !is_login_attempt(event) {
            return ThreatVerdict::safe(ID);
        }

        let fp_key = format!("cg:fp:{}", fingerprint(event));
        if ctx.store.is_blocked(&fp_key).unwrap_or(false) {
            return ThreatVerdict::block(
                ID,
                "Fingerprint blocked due to credential stuffing",
                &event.source_ip,
                BLOCK_DURATION.as_secs(),
            );
        }

        ThreatVerdict::safe(ID)
    }

    fn analyze_response(&self, response: ResponseEvent, ctx: &ModuleContext) -> ResponseEvent {
        if !is_login_path(&response.path) {
            return response;
        }

        if is_login_failure(response.status_code) {
            let path_key = format!("cg:path:{}", response.path);
            match ctx.store.increment_counter(&path_key, FAILURE_WINDOW) {
                Ok(count) => debug!(
                    "{} login failures on {} in current window",
                    count, response.path
                ),
                Err(e) => warn!("failed to count login failure on {}: {}", response.path, e),
            }
            if let Err(e) = ctx
                .store
                .increment_counter("cg:global:failures", FAILURE_WINDOW)
            {
                warn!("failed to count global login failure: {}", e);
            }
        }

        response
    }

    fn analyze_batch(&self, events: &[RequestEvent], ctx: &ModuleContext) -> Vec<ThreatVerdict> {
        let failures: Vec<&RequestEvent> = events
            .iter()
            .filter(|e| is_login_attempt(e) && is_login_failure(e.response_status))
            .collect();
        if failures.is_empty() {
            return Vec::new();
        }

        // A global failure spike looks the same as an attack from in here,
        // but it can just as well be a site-wide outage. Flag it and skip
        // the per-target blocks for this batch.
        let spike_threshold =
            ctx.config
                .module_option_u64(ID, "global-failure-spike", DEFAULT_GLOBAL_FAILURE_SPIKE);
        let global_failures = ctx.store.get_counter("cg:global:failures").unwrap_or(0);
        if global_failures > spike_threshold {
            warn!(
                "global login failure spike: {} failures in window",
                global_failures
            );
            return vec![ThreatVerdict::suspicious(
                ID,
                format!(
                    "Global login failure spike: {} failures in window",
                    global_failures
                ),
                "global",
            )];
        }

        let mut verdicts = Vec::new();

        // Per-target counting within the batch: the target is the attacked
        // account when known, the source address otherwise.
        let per_username_threshold = ctx.config.module_option_u64(
            ID,
            "per-username-failures",
            DEFAULT_PER_USERNAME_FAILURES,
        );
        let mut per_target: HashMap<&str, u64> = HashMap::new();
        for event in &failures {
            let target = event
                .user_id
                .as_deref()
                .unwrap_or(event.source_ip.as_str());
            *per_target.entry(target).or_default() += 1;
        }
        for (target, count) in per_target {
            if count >= per_username_threshold {
                warn!(
                    "credential stuffing against '{}': {} failed attempts in batch",
                    target, count
                );
                verdicts.push(ThreatVerdict::block(
                    ID,
                    format!("Credential stuffing: {} failed attempts", count),
                    target,
                    BLOCK_DURATION.as_secs(),
                ));
            }
        }

        // Fingerprint counters persist in the store across batches, so slow
        // stuffing from one client is caught even when each batch stays
        // under the per-target threshold.
        let per_fingerprint_threshold = ctx.config.module_option_u64(
            ID,
            "per-fingerprint-failures",
            DEFAULT_PER_FINGERPRINT_FAILURES,
        );
        let mut flagged_fingerprints: HashSet<String> = HashSet::new();
        for event in &failures {
            let fp_key = format!("cg:fp:{}", fingerprint(event));
            match ctx.store.increment_counter(&fp_key, FAILURE_WINDOW) {
                Ok(count) if count >= per_fingerprint_threshold => {
                    if flagged_fingerprints.insert(fp_key.clone()) {
                        warn!(
                            "credential stuffing from client '{}': {} failed attempts",
                            fp_key, count
                        );
                        verdicts.push(ThreatVerdict::block(
                            ID,
                            format!("Credential stuffing: {} failed attempts from one client", count),
                            fp_key,
                            BLOCK_DURATION.as_secs(),
                        ));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("failed to count fingerprint failure: {}", e),
            }
        }

        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiAnalyzer;
    use crate::config::{ModuleConfig, SentinAIConfig};
    use crate::store::{DecisionStore, InMemoryDecisionStore};
    use std::sync::Arc;

    fn context(config: SentinAIConfig) -> ModuleContext {
        ModuleContext::new(
            Arc::new(InMemoryDecisionStore::new()),
            Arc::new(AiAnalyzer::new(None)),
            Arc::new(config),
        )
    }

    fn login_failure(user: &str) -> RequestEvent {
        RequestEvent {
            method: "POST".into(),
            path: "/login".into(),
            source_ip: "203.0.113.7".into(),
            user_id: Some(user.into()),
            user_agent: Some("curl/8.0".into()),
            response_status: 401,
            ..Default::default()
        }
    }

    #[test]
    fn only_login_posts_are_in_scope() {
        assert!(is_login_path("/api/auth/signin"));
        assert!(is_login_path("/LOGIN"));
        assert!(!is_login_path("/api/orders"));

        let get = RequestEvent {
            method: "GET".into(),
            path: "/login".into(),
            ..Default::default()
        };
        assert!(!is_login_attempt(&get));
    }

    #[test]
    fn fingerprint_is_stable_and_header_sensitive() {
        let event = login_failure("alice");
        assert_eq!(fingerprint(&event), fingerprint(&event.clone()));

        let mut other = login_failure("alice");
        other.user_agent = Some("Mozilla/5.0".into());
        assert_ne!(fingerprint(&event), fingerprint(&other));
    }

    #[test]
    fn blocked_fingerprint_blocks_the_login_attempt() {
        let ctx = context(SentinAIConfig::default());
        let module = CredentialGuardModule::new();
        let event = login_failure("alice");

        assert!(!module.analyze_request(&event, &ctx).is_threat());

        let fp_key = format!("cg:fp:{}", fingerprint(&event));
        ctx.store.block(&fp_key, "stuffing", None).unwrap();

        let verdict = module.analyze_request(&event, &ctx);
        assert!(verdict.should_block());
        assert_eq!(verdict.target_identifier.as_deref(), Some("203.0.113.7"));
        assert_eq!(verdict.block_duration_secs, 1800);
    }

    #[test]
    fn failed_login_responses_feed_the_counters() {
        let ctx = context(SentinAIConfig::default());
        let module = CredentialGuardModule::new();

        let failure = ResponseEvent {
            request_id: "r1".into(),
            path: "/api/login".into(),
            status_code: 401,
            content_type: Some("application/json".into()),
            body: "{}".into(),
            response_time_ms: 20,
        };
        module.analyze_response(failure.clone(), &ctx);
        module.analyze_response(failure.with_body("{}"), &ctx);

        let success = ResponseEvent {
            request_id: "r2".into(),
            path: "/api/login".into(),
            status_code: 200,
            content_type: Some("application/json".into()),
            body: "{}".into(),
            response_time_ms: 20,
        };
        module.analyze_response(success, &ctx);

        assert_eq!(ctx.store.get_counter("cg:path:/api/login").unwrap(), 2);
        assert_eq!(ctx.store.get_counter("cg:global:failures").unwrap(), 2);
    }

    #[test]
    fn batch_blocks_the_hammered_account() {
        let ctx = context(SentinAIConfig::default());
        let module = CredentialGuardModule::new();

        let events: Vec<RequestEvent> = (0..12).map(|_| login_failure("admin")).collect();
        let verdicts = module.analyze_batch(&events, &ctx);

        let block = verdicts
            .iter()
            .find(|v| v.target_identifier.as_deref() == Some("admin"))
            .expect("expected a block verdict for admin");
        assert!(block.should_block());
        assert!(block.reason.contains("12 failed attempts"));
        assert_eq!(block.block_duration_secs, 1800);
    }

    #[test]
    fn batch_falls_back_to_source_ip_for_anonymous_failures() {
        let ctx = context(SentinAIConfig::default());
        let module = CredentialGuardModule::new();

        let events: Vec<RequestEvent> = (0..10)
            .map(|_| {
                let mut event = login_failure("ignored");
                event.user_id = None;
                event
            })
            .collect();
        let verdicts = module.analyze_batch(&events, &ctx);
        assert!(verdicts
            .iter()
            .any(|v| v.target_identifier.as_deref() == Some("203.0.113.7") && v.should_block()));
    }

    #[test]
    fn global_spike_suppresses_per_target_blocks() {
        let ctx = context(SentinAIConfig::default());
        let module = CredentialGuardModule::new();

        for _ in 0..501 {
            ctx.store
                .increment_counter("cg:global:failures", FAILURE_WINDOW)
                .unwrap();
        }

        let events: Vec<RequestEvent> = (0..12).map(|_| login_failure("admin")).collect();
        let verdicts = module.analyze_batch(&events, &ctx);

        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].should_block());
        assert_eq!(verdicts[0].target_identifier.as_deref(), Some("global"));
        assert!(verdicts[0].reason.contains("spike"));
    }

    #[test]
    fn fingerprint_counter_accumulates_across_batches() {
        let mut config = SentinAIConfig::default();
        config.modules.insert(
            ID.to_string(),
            ModuleConfig {
                enabled: true,
                config: [(
                    "per-fingerprint-failures".to_string(),
                    serde_yaml::Value::from(6),
                )]
                .into_iter()
                .collect(),
            },
        );
        let ctx = context(config);
        let module = CredentialGuardModule::new();

        // Four failures per batch stays under the per-target threshold of
        // ten, but the store-backed fingerprint counter keeps growing.
        let batch: Vec<RequestEvent> = (0..4).map(|_| login_failure("victim")).collect();
        assert!(module.analyze_batch(&batch, &ctx).is_empty());

        let verdicts = module.analyze_batch(&batch, &ctx);
        let fp_block = verdicts
            .iter()
            .find(|v| {
                v.target_identifier
                    .as_deref()
                    .is_some_and(|t| t.starts_with("cg:fp:"))
            })
            .expect("expected a fingerprint block");
        assert!(fp_block.should_block());
    }
}
