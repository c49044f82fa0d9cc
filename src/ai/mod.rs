pub mod openai;

pub use openai::OpenAiChatClient;

use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;

use crate::config::AiConfig;
use crate::model::{RequestEvent, ThreatVerdict};

const MODULE_ID: &str = "ai-analyzer";

/// Block duration handed out for AI BLOCK verdicts.
const AI_BLOCK_SECS: u64 = 1800;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat completion returned no content")]
    EmptyResponse,
}

/// The one capability the analyzer needs from a language model provider.
/// Concrete clients are wired at composition time.
pub trait ChatCompletion: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, AiError>;
}

/// Prompt-and-parse layer over an opaque chat completion endpoint.
///
/// Never invoked on the synchronous request path; batch workers call it and
/// can afford to block. Every transport or parse failure degrades to an
/// empty result; the analyzer never fails into its caller.
pub struct AiAnalyzer {
    client: Option<Arc<dyn ChatCompletion>>,
}

impl AiAnalyzer {
    pub fn new(client: Option<Arc<dyn ChatCompletion>>) -> Self {
        if client.is_some() {
            info!("AI analyzer initialized with a chat completion client");
        } else {
            warn!("AI analyzer not available, modules fall back to rule-based analysis");
        }
        Self { client }
    }

    pub fn from_config(config: &AiConfig) -> Self {
        Self::new(
            OpenAiChatClient::from_config(config)
                .map(|client| Arc::new(client) as Arc<dyn ChatCompletion>),
        )
    }

    pub fn is_available(&self) -> bool {
        self.client.is_some()
    }

    /// Analyze a batch of request events for suspicious patterns. Returns an
    /// empty list when unavailable or on any failure.
    pub fn analyze(&self, events: &[RequestEvent], context: &str) -> Vec<ThreatVerdict> {
        let Some(client) = &self.client else {
            return Vec::new();
        };
        if events.is_empty() {
            return Vec::new();
        }

        let prompt = build_batch_prompt(events, context);
        match client.complete(&prompt) {
            Ok(response) => parse_batch_response(&response),
            Err(e) => {
                error!("AI batch analysis failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Ask a specific question about a single request. Degrades to a safe
    /// verdict when unavailable or on failure.
    pub fn analyze_single(&self, event: &RequestEvent, question: &str) -> ThreatVerdict {
        let Some(client) = &self.client else {
            return ThreatVerdict::safe(MODULE_ID);
        };

        let prompt = build_single_prompt(event, question);
        match client.complete(&prompt) {
            Ok(response) => parse_single_response(&response),
            Err(e) => {
                error!("AI single analysis failed: {}", e);
                ThreatVerdict::safe(MODULE_ID)
            }
        }
    }
}

fn build_batch_prompt(events: &[RequestEvent], context: &str) -> String {
    let mut prompt = String::from(
        "You are SentinAI, an API security analyzer. Analyze the following batch of HTTP requests.\n\n",
    );
    prompt.push_str(&format!("Context: {}\n\nEvents:\n", context));

    for (i, event) in events.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {} {} from IP={} user={} UA={} status={} time={}ms\n",
            i + 1,
            event.method,
            event.path,
            event.source_ip,
            event.user_id.as_deref().unwrap_or("anonymous"),
            event.user_agent.as_deref().unwrap_or("unknown"),
            event.response_status,
            event.response_time_ms,
        ));
    }

    prompt.push_str("\nRespond with one of: SAFE, SUSPICIOUS, BLOCK\n");
    prompt.push_str("If SUSPICIOUS or BLOCK, explain the pattern you detected.\n");
    prompt.push_str("Format: VERDICT|REASON|TARGET_IDENTIFIER\n");
    prompt
}

fn build_single_prompt(event: &RequestEvent, question: &str) -> String {
    format!(
        "You are SentinAI, an API security analyzer.\n\n\
         Request: {} {}\nIP: {}\nUser: {}\nUser-Agent: {}\n\
         Query: {}\nBody: {}\n\n\
         Question: {}\n\n\
         Respond with: SAFE, SUSPICIOUS, or BLOCK followed by a brief reason.\n\
         Format: VERDICT|REASON",
        event.method,
        event.path,
        event.source_ip,
        event.user_id.as_deref().unwrap_or("anonymous"),
        event.user_agent.as_deref().unwrap_or("unknown"),
        event.query_string.as_deref().unwrap_or(""),
        event.body.as_deref().unwrap_or(""),
        question,
    )
}

/// Parse `VERDICT|REASON|TARGET` lines. Lines without a pipe are model
/// chatter and are skipped; unknown verdict tokens are dropped.
fn parse_batch_response(response: &str) -> Vec<ThreatVerdict> {
    response
        .lines()
        .filter(|line| line.contains('|'))
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let verdict = parts.next().unwrap_or("").trim().to_ascii_uppercase();
            let reason = parts
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("AI detected threat");
            let target = parts
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("unknown");

            match verdict.as_str() {
                "BLOCK" => Some(ThreatVerdict::block(MODULE_ID, reason, target, AI_BLOCK_SECS)),
                "SUSPICIOUS" => Some(ThreatVerdict::suspicious(MODULE_ID, reason, target)),
                _ => None,
            }
        })
        .collect()
}

fn parse_single_response(response: &str) -> ThreatVerdict {
    let mut parts = response.splitn(2, '|');
    let verdict = parts.next().unwrap_or("").trim().to_ascii_uppercase();
    let reason = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("AI analysis");

    match verdict.as_str() {
        "BLOCK" => ThreatVerdict::block(MODULE_ID, reason, "request", AI_BLOCK_SECS),
        "SUSPICIOUS" => ThreatVerdict::suspicious(MODULE_ID, reason, "request"),
        _ => ThreatVerdict::safe(MODULE_ID),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Action;

    struct CannedClient(&'static str);

    impl ChatCompletion for CannedClient {
        fn complete(&self, _prompt: &str) -> Result<String, AiError> {
            Ok(self.0.to_string())
        }
    }

    struct FailingClient;

    impl ChatCompletion for FailingClient {
        fn complete(&self, _prompt: &str) -> Result<String, AiError> {
            Err(AiError::EmptyResponse)
        }
    }

    fn event() -> RequestEvent {
        RequestEvent {
            method: "GET".into(),
            path: "/api/orders/1".into(),
            source_ip: "10.0.0.1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn unavailable_analyzer_returns_nothing() {
        let analyzer = AiAnalyzer::new(None);
        assert!(!analyzer.is_available());
        assert!(analyzer.analyze(&[event()], "test").is_empty());
        assert!(!analyzer.analyze_single(&event(), "sqli?").is_threat());
    }

    #[test]
    fn parses_structured_lines_and_ignores_chatter() {
        let analyzer = AiAnalyzer::new(Some(Arc::new(CannedClient(
            "Here is my assessment of the batch:\n\
             \n\
             BLOCK | rapid ID enumeration | alice \n\
             SUSPICIOUS|unusual user agent|10.0.0.9\n\
             SAFE|nothing here|bob\n\
             MAYBE|not a verdict|x\n\
             Let me know if you need more detail.",
        ))));

        let verdicts = analyzer.analyze(&[event()], "recent traffic");
        assert_eq!(verdicts.len(), 2);

        assert_eq!(verdicts[0].recommended_action, Action::Block);
        assert_eq!(verdicts[0].reason, "rapid ID enumeration");
        assert_eq!(verdicts[0].target_identifier.as_deref(), Some("alice"));
        assert_eq!(verdicts[0].block_duration_secs, 1800);

        assert_eq!(verdicts[1].recommended_action, Action::Log);
        assert_eq!(verdicts[1].target_identifier.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn missing_fields_get_placeholders() {
        let analyzer = AiAnalyzer::new(Some(Arc::new(CannedClient("BLOCK|"))));
        let verdicts = analyzer.analyze(&[event()], "ctx");
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].reason, "AI detected threat");
        assert_eq!(verdicts[0].target_identifier.as_deref(), Some("unknown"));
    }

    #[test]
    fn transport_failure_degrades_to_empty() {
        let analyzer = AiAnalyzer::new(Some(Arc::new(FailingClient)));
        assert!(analyzer.analyze(&[event()], "ctx").is_empty());
        let verdict = analyzer.analyze_single(&event(), "sqli?");
        assert!(!verdict.is_threat());
    }

    #[test]
    fn single_response_parses_verdict_and_reason() {
        let analyzer = AiAnalyzer::new(Some(Arc::new(CannedClient(
            "SUSPICIOUS|looks like probing",
        ))));
        let verdict = analyzer.analyze_single(&event(), "is this probing?");
        assert!(verdict.is_threat());
        assert_eq!(verdict.reason, "looks like probing");
    }

    #[test]
    fn batch_prompt_enumerates_events() {
        let events = vec![
            event().with_response_data(401, 12),
            RequestEvent {
                method: "POST".into(),
                path: "/login".into(),
                source_ip: "10.0.0.2".into(),
                user_id: Some("bob".into()),
                ..Default::default()
            },
        ];
        let prompt = build_batch_prompt(&events, "failed logins");
        assert!(prompt.contains("Context: failed logins"));
        assert!(prompt.contains("[1] GET /api/orders/1 from IP=10.0.0.1 user=anonymous"));
        assert!(prompt.contains("status=401"));
        assert!(prompt.contains("[2] POST /login from IP=10.0.0.2 user=bob"));
        assert!(prompt.contains("Format: VERDICT|REASON|TARGET_IDENTIFIER"));
    }
}
