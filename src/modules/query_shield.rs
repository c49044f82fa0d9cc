use std::borrow::Cow;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{ModuleContext, SecurityModule};
use crate::model::{RequestEvent, ResponseEvent, ThreatVerdict};

const ID: &str = "query-shield";

const DEFAULT_MAX_CONCURRENCY: u64 = 50;
const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u64 = 5;
const DEFAULT_SLOW_RESPONSE_MS: u64 = 3000;

const PATTERN_BLOCK_DURATION: Duration = Duration::from_secs(10 * 60);
const WILDCARD_BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);
const CIRCUIT_RECOVERY: Duration = Duration::from_secs(30);

// Block these immediately, they are never legitimate query content.
static DANGEROUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)['"]\s*(OR|AND)\s+['"]?\d"#).unwrap(),
        Regex::new(r"(?i)\bSLEEP\s*\(").unwrap(),
        Regex::new(r"(?i)\bUNION\s+SELECT\b").unwrap(),
        Regex::new(r"(?i)\$where\b").unwrap(),
        Regex::new(r"(?i)\bDROP\s+TABLE\b").unwrap(),
        Regex::new(r"(?i)<script[^>]*>").unwrap(),
        Regex::new(r"(?i)javascript\s*:").unwrap(),
        Regex::new(r"(?i)\beval\s*\(").unwrap(),
    ]
});

// Wildcard-only search values can make the database return everything.
static WILDCARD_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^%+$").unwrap(),
        Regex::new(r"^_+$").unwrap(),
        Regex::new(r"(?i)\bLIKE\s+'%").unwrap(),
    ]
});

#[derive(Default)]
struct CircuitState {
    failure_count: u64,
    open: bool,
    opened_at: Option<Instant>,
}

impl CircuitState {
    /// Open circuits admit traffic again once the recovery window has
    /// passed; the reset happens on the next observation, traffic or not.
    fn is_open(&mut self) -> bool {
        if !self.open {
            return false;
        }
        if matches!(self.opened_at, Some(at) if at.elapsed() > CIRCUIT_RECOVERY) {
            self.open = false;
            self.failure_count = 0;
            return false;
        }
        true
    }
}

/// Guards against expensive-query abuse in three layers: known-malicious
/// payload patterns, wildcard-only search values, and per-endpoint
/// concurrency caps backed by a circuit breaker over slow responses.
///
/// Circuit and in-flight state are process-local on purpose: they signal
/// stress on this instance, and sharing them through the decision store
/// would let one slow instance trip the whole fleet.
pub struct QueryShieldModule {
    in_flight: DashMap<String, AtomicI64>,
    circuits: DashMap<String, CircuitState>,
}

impl QueryShieldModule {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            circuits: DashMap::new(),
        }
    }
}

impl Default for QueryShieldModule {
    fn default() -> Self {
        Self::new()
    }
}

fn url_decode(raw: &str) -> Cow<'_, str> {
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

/// Decoded query string and body concatenated into one haystack.
fn build_full_query(event: &RequestEvent) -> String {
    let mut haystack = String::new();
    if let Some(query) = &event.query_string {
        haystack.push_str(&url_decode(query));
    }
    if let Some(body) = &event.body {
        haystack.push(' ');
        haystack.push_str(body);
    }
    haystack
}

impl SecurityModule for QueryShieldModule {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Query Shield"
    }

    fn order(&self) -> i32 {
        200
    }

    fn analyze_request(&self, event: &RequestEvent, ctx: &ModuleContext) -> ThreatVerdict {
        let haystack = build_full_query(event);
        for pattern in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(&haystack) {
                warn!(
                    "dangerous pattern {} detected in {}",
                    pattern.as_str(),
                    event.path
                );
                return ThreatVerdict::block(
                    ID,
                    format!("Dangerous query pattern detected: {}", pattern.as_str()),
                    &event.source_ip,
                    PATTERN_BLOCK_DURATION.as_secs(),
                );
            }
        }

        if let Some(query) = &event.query_string {
            let decoded = url_decode(query);
            for pair in decoded.split('&') {
                let mut kv = pair.splitn(2, '=');
                let (Some(key), Some(value)) = (kv.next(), kv.next()) else {
                    continue;
                };
                if WILDCARD_PATTERNS.iter().any(|p| p.is_match(value)) {
                    return ThreatVerdict::block(
                        ID,
                        format!("Wildcard query abuse detected: {}={}", key, value),
                        &event.source_ip,
                        WILDCARD_BLOCK_DURATION.as_secs(),
                    );
                }
            }
        }

        if let Some(mut circuit) = self.circuits.get_mut(&event.path) {
            if circuit.is_open() {
                return ThreatVerdict::throttle(
                    ID,
                    format!(
                        "Circuit breaker OPEN for {} - endpoint under stress",
                        event.path
                    ),
                    &event.source_ip,
                );
            }
        }

        let max_concurrency =
            ctx.config
                .module_option_u64(ID, "max-concurrency", DEFAULT_MAX_CONCURRENCY) as i64;
        let current = {
            let active = self
                .in_flight
                .entry(event.path.clone())
                .or_insert_with(|| AtomicI64::new(0));
            active.fetch_add(1, Ordering::SeqCst) + 1
        };
        if current > max_concurrency {
            if let Some(active) = self.in_flight.get(&event.path) {
                active.fetch_sub(1, Ordering::SeqCst);
            }
            warn!(
                "concurrency limit reached for {}: {}/{}",
                event.path, current, max_concurrency
            );
            return ThreatVerdict::throttle(
                ID,
                format!("Concurrency limit reached for {}", event.path),
                &event.source_ip,
            );
        }

        ThreatVerdict::safe(ID)
    }

    fn analyze_response(&self, response: ResponseEvent, ctx: &ModuleContext) -> ResponseEvent {
        // The request path took the slot, the response path gives it back.
        if let Some(active) = self.in_flight.get(&response.path) {
            active.fetch_sub(1, Ordering::SeqCst);
        }

        let slow_ms = ctx
            .config
            .module_option_u64(ID, "slow-response-ms", DEFAULT_SLOW_RESPONSE_MS);
        let threshold = ctx.config.module_option_u64(
            ID,
            "circuit-breaker-threshold",
            DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
        );

        if response.response_time_ms > slow_ms {
            let mut circuit = self.circuits.entry(response.path.clone()).or_default();
            circuit.failure_count += 1;
            if circuit.failure_count >= threshold && !circuit.open {
                circuit.open = true;
                circuit.opened_at = Some(Instant::now());
                warn!(
                    "circuit OPENED for {} - {} consecutive slow responses",
                    response.path, circuit.failure_count
                );
            }
        } else if let Some(mut circuit) = self.circuits.get_mut(&response.path) {
            circuit.failure_count = circuit.failure_count.saturating_sub(1);
            if circuit.failure_count == 0 {
                circuit.open = false;
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiAnalyzer;
    use crate::config::{ModuleConfig, SentinAIConfig};
    use crate::model::Action;
    use crate::store::InMemoryDecisionStore;
    use std::sync::Arc;

    fn context(config: SentinAIConfig) -> ModuleContext {
        ModuleContext::new(
            Arc::new(InMemoryDecisionStore::new()),
            Arc::new(AiAnalyzer::new(None)),
            Arc::new(config),
        )
    }

    fn search(query: &str) -> RequestEvent {
        RequestEvent {
            method: "GET".into(),
            path: "/api/search".into(),
            query_string: Some(query.into()),
            source_ip: "198.51.100.4".into(),
            ..Default::default()
        }
    }

    fn response(path: &str, time_ms: u64) -> ResponseEvent {
        ResponseEvent {
            request_id: "r1".into(),
            path: path.into(),
            status_code: 200,
            content_type: Some("application/json".into()),
            body: "{}".into(),
            response_time_ms: time_ms,
        }
    }

    #[test]
    fn encoded_sql_tautology_is_blocked() {
        let ctx = context(SentinAIConfig::default());
        let module = QueryShieldModule::new();

        // Decodes to `q=' OR '1'='1`.
        let verdict = module.analyze_request(&search("q=%27%20OR%20%271%27%3D%271"), &ctx);
        assert!(verdict.should_block());
        assert!(verdict.reason.contains("Dangerous query pattern"));
        assert_eq!(verdict.target_identifier.as_deref(), Some("198.51.100.4"));
        assert_eq!(verdict.block_duration_secs, 600);
    }

    #[test]
    fn dangerous_body_is_blocked_too() {
        let ctx = context(SentinAIConfig::default());
        let module = QueryShieldModule::new();

        let mut event = search("q=books");
        event.body = Some("{\"filter\":{\"$where\":\"sleep(1000)\"}}".into());
        let verdict = module.analyze_request(&event, &ctx);
        assert!(verdict.should_block());
    }

    #[test]
    fn wildcard_only_values_are_blocked() {
        let ctx = context(SentinAIConfig::default());
        let module = QueryShieldModule::new();

        // `q=%25%25` decodes to `q=%%`.
        let verdict = module.analyze_request(&search("q=%25%25"), &ctx);
        assert!(verdict.should_block());
        assert!(verdict.reason.contains("Wildcard query abuse"));
        assert_eq!(verdict.block_duration_secs, 300);

        let verdict = module.analyze_request(&search("name=___"), &ctx);
        assert!(verdict.should_block());

        assert!(!module.analyze_request(&search("q=50%25+off"), &ctx).is_threat());
    }

    #[test]
    fn concurrency_cap_throttles_and_response_releases() {
        let mut config = SentinAIConfig::default();
        config.modules.insert(
            ID.to_string(),
            ModuleConfig {
                enabled: true,
                config: [("max-concurrency".to_string(), serde_yaml::Value::from(2))]
                    .into_iter()
                    .collect(),
            },
        );
        let ctx = context(config);
        let module = QueryShieldModule::new();
        let event = search("q=books");

        assert!(!module.analyze_request(&event, &ctx).is_threat());
        assert!(!module.analyze_request(&event, &ctx).is_threat());

        let verdict = module.analyze_request(&event, &ctx);
        assert_eq!(verdict.recommended_action, Action::Throttle);

        // A completed response frees a slot.
        module.analyze_response(response("/api/search", 10), &ctx);
        assert!(!module.analyze_request(&event, &ctx).is_threat());
    }

    #[test]
    fn slow_responses_trip_the_circuit() {
        let ctx = context(SentinAIConfig::default());
        let module = QueryShieldModule::new();

        for _ in 0..5 {
            module.analyze_response(response("/api/report", 4000), &ctx);
        }

        let event = RequestEvent {
            method: "GET".into(),
            path: "/api/report".into(),
            query_string: Some("q=ok".into()),
            source_ip: "198.51.100.4".into(),
            ..Default::default()
        };
        let verdict = module.analyze_request(&event, &ctx);
        assert_eq!(verdict.recommended_action, Action::Throttle);
        assert!(verdict.reason.contains("Circuit breaker OPEN"));
    }

    #[test]
    fn fast_responses_wind_the_circuit_back_down() {
        let ctx = context(SentinAIConfig::default());
        let module = QueryShieldModule::new();

        for _ in 0..4 {
            module.analyze_response(response("/api/report", 4000), &ctx);
        }
        for _ in 0..4 {
            module.analyze_response(response("/api/report", 50), &ctx);
        }

        let circuit = module.circuits.get("/api/report").unwrap();
        assert_eq!(circuit.failure_count, 0);
        assert!(!circuit.open);
    }

    #[test]
    fn open_circuit_recovers_after_the_cooldown() {
        let ctx = context(SentinAIConfig::default());
        let module = QueryShieldModule::new();

        for _ in 0..5 {
            module.analyze_response(response("/api/report", 4000), &ctx);
        }
        // Backdate the trip past the recovery window.
        module.circuits.get_mut("/api/report").unwrap().opened_at =
            Some(Instant::now() - Duration::from_secs(31));

        let event = RequestEvent {
            method: "GET".into(),
            path: "/api/report".into(),
            source_ip: "198.51.100.4".into(),
            ..Default::default()
        };
        assert!(!module.analyze_request(&event, &ctx).is_threat());
        assert!(!module.circuits.get("/api/report").unwrap().open);
    }
}
