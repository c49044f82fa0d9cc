pub mod body;

pub use body::CachedBody;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use log::error;
use serde_json::json;
use uuid::Uuid;

use crate::config::SentinAIConfig;
use crate::engine::SentinAIEngine;
use crate::model::{Action, RequestEvent, ResponseEvent};
use crate::modules::{ModuleContext, ModuleRegistry};
use crate::store::{self, StoreError};

/// The host framework's view of a request, handed to the filter as an owned
/// value. The host resolves its authenticated principal before calling in;
/// everything else is raw wire data.
pub struct HostRequest {
    pub method: String,
    pub path: String,
    /// Raw query string, still URL-encoded.
    pub query_string: Option<String>,
    /// Header names in wire casing; the filter lower-cases them.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub remote_addr: String,
    /// Identity resolved by the host's authentication layer, if any.
    pub principal: Option<String>,
    pub session_id: Option<String>,
}

/// The host framework's view of a response.
#[derive(Debug)]
pub struct HostResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Wraps one request/response round-trip: builds the event, enforces the
/// engine's verdict, runs egress analysis and submits the event for batch
/// analysis. Analysis failures never disturb the host's request.
pub struct SecurityFilter {
    engine: Arc<SentinAIEngine>,
    config: Arc<SentinAIConfig>,
}

impl SecurityFilter {
    pub fn new(engine: Arc<SentinAIEngine>, config: Arc<SentinAIConfig>) -> Self {
        Self { engine, config }
    }

    /// Assemble the whole stack from configuration: store variant, AI
    /// analyzer, bundled modules, engine and filter.
    pub fn from_config(config: SentinAIConfig) -> Result<Self, StoreError> {
        let config = Arc::new(config);
        let store = store::from_config(&config.store)?;
        let ai = Arc::new(crate::ai::AiAnalyzer::from_config(&config.ai));
        let context = Arc::new(ModuleContext::new(store, ai, config.clone()));
        let engine = Arc::new(SentinAIEngine::new(ModuleRegistry::bundled(), context));
        Ok(Self::new(engine, config))
    }

    pub fn engine(&self) -> &Arc<SentinAIEngine> {
        &self.engine
    }

    /// Run one round-trip: analyze the request, call `downstream` unless the
    /// verdict denies it, then analyze and possibly rewrite the response.
    ///
    /// A downstream error propagates unchanged; the captured event is still
    /// submitted for async analysis first.
    pub fn around<E>(
        &self,
        request: &HostRequest,
        downstream: impl FnOnce(&HostRequest) -> Result<HostResponse, E>,
    ) -> Result<HostResponse, E> {
        if !self.config.enabled {
            return downstream(request);
        }

        let request_id = new_request_id();
        let started = Instant::now();
        let cached_body = CachedBody::new(request.body.clone());
        let event = build_request_event(request, &request_id, &cached_body);

        let verdict = self.engine.process_request(&event);
        if verdict.is_threat() && self.config.is_active_mode() {
            if let Some(status) = denial_status(verdict.recommended_action) {
                return Ok(denial_response(status, &verdict.reason, &request_id));
            }
        }

        let mut response = match downstream(request) {
            Ok(response) => response,
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.engine
                    .submit_for_async_analysis(event.with_response_data(500, elapsed));
                return Err(e);
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;

        if !response.body.is_empty()
            && response
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.contains("json"))
        {
            let response_body = CachedBody::new(response.body.clone());
            if let Some(text) = response_body.as_text() {
                let response_event = ResponseEvent {
                    request_id: request_id.clone(),
                    path: event.path.clone(),
                    status_code: response.status,
                    content_type: response.content_type.clone(),
                    body: text.to_owned(),
                    response_time_ms: elapsed,
                };
                let processed = self.engine.process_response(response_event);
                if processed.body != text {
                    response.body = Bytes::from(processed.body);
                }
            } else {
                error!("response to {} declared json but is not utf-8", event.path);
            }
        }

        self.engine
            .submit_for_async_analysis(event.with_response_data(response.status, elapsed));

        Ok(response)
    }
}

fn new_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn denial_status(action: Action) -> Option<u16> {
    match action {
        Action::Block | Action::Challenge => Some(403),
        Action::Throttle => Some(429),
        _ => None,
    }
}

fn denial_response(status: u16, reason: &str, request_id: &str) -> HostResponse {
    let body = json!({
        "error": "Request blocked by SentinAI",
        "reason": reason,
        "requestId": request_id,
    })
    .to_string();
    HostResponse {
        status,
        content_type: Some("application/json".to_string()),
        body: Bytes::from(body),
    }
}

fn build_request_event(
    request: &HostRequest,
    request_id: &str,
    body: &CachedBody,
) -> RequestEvent {
    let mut headers = HashMap::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        headers.insert(name.to_lowercase(), value.clone());
    }

    // Prefer the host-resolved principal; fall back to the username of a
    // Basic credential. The password is never kept.
    let user_id = request.principal.clone().or_else(|| {
        basic_auth_username(headers.get("authorization").map(String::as_str))
    });
    let source_ip = resolve_source_ip(&headers, &request.remote_addr);
    let user_agent = headers.get("user-agent").cloned();

    RequestEvent {
        request_id: request_id.to_string(),
        method: request.method.clone(),
        path: request.path.clone(),
        query_string: request.query_string.clone(),
        headers,
        body: body.as_text().filter(|text| !text.is_empty()).map(str::to_owned),
        source_ip,
        user_agent,
        user_id,
        session_id: request.session_id.clone(),
        fingerprint: None,
        timestamp: SystemTime::now(),
        response_status: 0,
        response_time_ms: 0,
    }
}

/// Proxy-aware source address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket address.
fn resolve_source_ip(headers: &HashMap<String, String>, remote_addr: &str) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip") {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    remote_addr.to_string()
}

fn basic_auth_username(header: Option<&str>) -> Option<String> {
    let header = header?.trim();
    let scheme = header.get(..6)?;
    if !scheme.eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = STANDARD.decode(header[6..].trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let username = credentials.splitn(2, ':').next()?;
    if username.is_empty() {
        None
    } else {
        Some(username.to_string())
    }
}
