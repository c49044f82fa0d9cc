use std::collections::HashMap;
use std::time::SystemTime;

/// Immutable capture of one inbound HTTP request.
///
/// This is the primary input to every security module. Header names are
/// lower-cased by the filter adapter before the event is built, so modules
/// can look them up without caring about the wire casing.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// Opaque 8-char token assigned by the filter adapter.
    pub request_id: String,
    pub method: String,
    pub path: String,
    /// Raw (still URL-encoded) query string, if any.
    pub query_string: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub source_ip: String,
    pub user_agent: Option<String>,
    /// Authenticated identity, if one was resolved.
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub fingerprint: Option<String>,
    pub timestamp: SystemTime,
    /// 0 until the response is known.
    pub response_status: u16,
    /// 0 until the response is known.
    pub response_time_ms: u64,
}

impl RequestEvent {
    /// Copy of this event with the observed response status and elapsed time.
    pub fn with_response_data(&self, status: u16, response_time_ms: u64) -> RequestEvent {
        RequestEvent {
            response_status: status,
            response_time_ms,
            ..self.clone()
        }
    }
}

impl Default for RequestEvent {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            method: String::new(),
            path: String::new(),
            query_string: None,
            headers: HashMap::new(),
            body: None,
            source_ip: String::new(),
            user_agent: None,
            user_id: None,
            session_id: None,
            fingerprint: None,
            timestamp: SystemTime::now(),
            response_status: 0,
            response_time_ms: 0,
        }
    }
}

/// Immutable capture of one outbound response body for egress scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEvent {
    pub request_id: String,
    pub path: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub response_time_ms: u64,
}

impl ResponseEvent {
    /// Copy of this event carrying a replacement body.
    pub fn with_body(&self, body: impl Into<String>) -> ResponseEvent {
        ResponseEvent {
            body: body.into(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_response_data_keeps_everything_else() {
        let event = RequestEvent {
            request_id: "ab12cd34".into(),
            method: "GET".into(),
            path: "/api/orders/7".into(),
            source_ip: "10.0.0.1".into(),
            user_id: Some("alice".into()),
            ..Default::default()
        };

        let done = event.with_response_data(200, 42);
        assert_eq!(done.response_status, 200);
        assert_eq!(done.response_time_ms, 42);
        assert_eq!(done.request_id, event.request_id);
        assert_eq!(done.path, event.path);
        assert_eq!(done.user_id, event.user_id);
        // The original is untouched.
        assert_eq!(event.response_status, 0);
    }

    #[test]
    fn with_body_replaces_only_the_body() {
        let response = ResponseEvent {
            request_id: "ab12cd34".into(),
            path: "/api/users/5".into(),
            status_code: 200,
            content_type: Some("application/json".into()),
            body: "{\"ssn\":\"123-45-6789\"}".into(),
            response_time_ms: 10,
        };

        let redacted = response.with_body("{}");
        assert_eq!(redacted.body, "{}");
        assert_eq!(redacted.status_code, 200);
        assert_eq!(redacted.path, response.path);
    }
}
