use crate::auth::error_message_from_body;
use crate::redact::redact_secrets;
use crate::state::SessionManager;
use crate::types::InvokeResponse;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

const FUNCTIONS_PATH: &str = "/functions/v1";

pub const NO_SESSION_MESSAGE: &str = "No authenticated session";

/// Lowercase substrings that mark an error as an expired or rejected token.
const AUTH_ERROR_MARKERS: [&str; 4] = ["401", "invalid jwt", "unauthorized", "expired"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FunctionError {
    #[error("Edge function returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid function response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRequest {
    pub name: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

/// One remote function call. Implementations never retry.
#[async_trait]
pub trait FunctionTransport: Send + Sync {
    async fn invoke(&self, request: FunctionRequest) -> Result<Value, FunctionError>;
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl InvokeOptions {
    pub fn with_body(body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }
}

pub fn is_auth_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    AUTH_ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn build_request(name: &str, options: &InvokeOptions, access_token: &str) -> FunctionRequest {
    let mut headers: BTreeMap<String, String> = options
        .headers
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case(AUTHORIZATION.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.insert(
        AUTHORIZATION.as_str().to_string(),
        format!("Bearer {access_token}"),
    );
    FunctionRequest {
        name: name.to_string(),
        body: options.body.clone(),
        headers,
    }
}

#[derive(Clone)]
pub struct AuthenticatedInvoker {
    sessions: SessionManager,
    transport: Arc<dyn FunctionTransport>,
}

impl AuthenticatedInvoker {
    pub fn new(sessions: SessionManager, transport: Arc<dyn FunctionTransport>) -> Self {
        Self {
            sessions,
            transport,
        }
    }

    /// Calls `name` with the current bearer token.
    ///
    /// An auth-shaped failure triggers one coordinated refresh and one retry.
    /// Every other failure is returned unchanged. When the refresh itself
    /// fails the caller sees the original error, not the refresh error.
    pub async fn invoke(&self, name: &str, options: InvokeOptions) -> InvokeResponse {
        let Some(session) = self.sessions.get_current_session().await else {
            tracing::debug!(function = name, "invoke skipped: no session");
            return InvokeResponse::err(NO_SESSION_MESSAGE);
        };

        let original = match self
            .transport
            .invoke(build_request(name, &options, &session.access_token))
            .await
        {
            Ok(data) => return InvokeResponse::ok(data),
            Err(e) => redact_secrets(&e.to_string()).into_owned(),
        };

        if !is_auth_error(&original) {
            tracing::debug!(function = name, error = %original, "function call failed");
            return InvokeResponse::err(original);
        }

        tracing::info!(function = name, "function call rejected the token; refreshing once");
        let refreshed = self.sessions.safe_refresh_session().await;
        let Some(fresh) = refreshed.session.filter(|_| refreshed.success) else {
            return InvokeResponse::err(original);
        };

        match self
            .transport
            .invoke(build_request(name, &options, &fresh.access_token))
            .await
        {
            Ok(data) => InvokeResponse::ok(data),
            Err(e) => InvokeResponse::err(redact_secrets(&e.to_string()).into_owned()),
        }
    }
}

pub struct HttpFunctionTransport {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl HttpFunctionTransport {
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self, FunctionError> {
        Ok(Self {
            http: reqwest::Client::builder()
                .build()
                .map_err(|e| FunctionError::Network(e.to_string()))?,
            base_url: format!("{}{FUNCTIONS_PATH}", project_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
        })
    }

    fn build_headers(&self, request: &FunctionRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.anon_key) {
            headers.insert(HeaderName::from_static("apikey"), value);
        }
        for (key, raw) in &request.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(raw),
            ) else {
                tracing::warn!(header = %key, "dropping invalid header");
                continue;
            };
            headers.insert(name, value);
        }
        headers
    }
}

#[async_trait]
impl FunctionTransport for HttpFunctionTransport {
    async fn invoke(&self, request: FunctionRequest) -> Result<Value, FunctionError> {
        let url = format!("{}/{}", self.base_url, urlencoding::encode(&request.name));
        let mut builder = self.http.post(url).headers(self.build_headers(&request));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let res = builder
            .send()
            .await
            .map_err(|e| FunctionError::Network(redact_secrets(&e.to_string()).into_owned()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| FunctionError::Network(redact_secrets(&e.to_string()).into_owned()))?;

        if !status.is_success() {
            let message = error_message_from_body(&text).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
            return Err(FunctionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionStore;
    use crate::test_support::{session, FakeAuthProvider, FakeTransport};
    use serde_json::json;
    use std::time::Duration;

    fn status(code: u16, message: &str) -> FunctionError {
        FunctionError::Status {
            status: code,
            message: message.to_string(),
        }
    }

    async fn invoker(
        auth: Arc<FakeAuthProvider>,
        transport: Arc<FakeTransport>,
        token: Option<&str>,
    ) -> AuthenticatedInvoker {
        let sessions = SessionManager::new(auth, SessionStore::in_memory());
        if let Some(token) = token {
            sessions.store().replace(session("u1", token)).await;
        }
        AuthenticatedInvoker::new(sessions, transport)
    }

    #[test]
    fn auth_markers_are_case_insensitive() {
        assert!(is_auth_error("Edge function returned 401: nope"));
        assert!(is_auth_error("Invalid JWT"));
        assert!(is_auth_error("UNAUTHORIZED"));
        assert!(is_auth_error("jwt expired"));
        assert!(!is_auth_error("validation failed: phone is required"));
        assert!(!is_auth_error("Edge function returned 500: upstream timeout"));
    }

    #[test]
    fn caller_authorization_header_is_replaced() {
        let mut options = InvokeOptions::with_body(json!({ "orderId": 7 }));
        options
            .headers
            .insert("authorization".to_string(), "Bearer anon".to_string());
        options
            .headers
            .insert("x-request-id".to_string(), "abc".to_string());

        let request = build_request("send-sms", &options, "user-token");
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.headers["authorization"], "Bearer user-token");
        assert_eq!(request.headers["x-request-id"], "abc");
        assert_eq!(request.body, Some(json!({ "orderId": 7 })));
    }

    #[tokio::test]
    async fn no_session_fails_without_network() {
        let auth = Arc::new(FakeAuthProvider::new());
        let transport = Arc::new(FakeTransport::new(|_| Ok(json!(1))));
        let invoker = invoker(auth.clone(), transport.clone(), None).await;

        let res = invoker.invoke("call-analytics", InvokeOptions::default()).await;
        assert_eq!(res, InvokeResponse::err(NO_SESSION_MESSAGE));
        assert_eq!(transport.calls(), 0);
        assert_eq!(auth.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn success_returns_data() {
        let auth = Arc::new(FakeAuthProvider::new());
        let transport = Arc::new(FakeTransport::new(|_| Ok(json!({ "calls": 12 }))));
        let invoker = invoker(auth, transport.clone(), Some("t1")).await;

        let res = invoker.invoke("call-analytics", InvokeOptions::default()).await;
        assert_eq!(res, InvokeResponse::ok(json!({ "calls": 12 })));
        assert_eq!(transport.tokens(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn non_auth_error_is_not_retried() {
        let auth = Arc::new(FakeAuthProvider::new());
        let transport = Arc::new(FakeTransport::new(|_| Err(status(422, "validation failed"))));
        let invoker = invoker(auth.clone(), transport.clone(), Some("t1")).await;

        let res = invoker.invoke("send-sms", InvokeOptions::default()).await;
        assert_eq!(
            res.error.as_deref(),
            Some("Edge function returned 422: validation failed")
        );
        assert_eq!(auth.refresh_calls(), 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn auth_error_refreshes_once_and_retries_once() {
        let auth = Arc::new(FakeAuthProvider::new());
        let transport = Arc::new(FakeTransport::new(|req| {
            if req.headers["authorization"] == "Bearer t1" {
                Err(status(401, "Invalid JWT"))
            } else {
                Ok(json!("ok"))
            }
        }));
        let invoker = invoker(auth.clone(), transport.clone(), Some("t1")).await;

        let res = invoker.invoke("summarize-call", InvokeOptions::default()).await;
        assert_eq!(res, InvokeResponse::ok(json!("ok")));
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(transport.calls(), 2);
        assert_eq!(transport.tokens()[1], "fresh-1");
    }

    #[tokio::test]
    async fn retry_failure_is_returned_without_further_retries() {
        let auth = Arc::new(FakeAuthProvider::new());
        let transport = Arc::new(FakeTransport::new(|_| Err(status(401, "still unauthorized"))));
        let invoker = invoker(auth.clone(), transport.clone(), Some("t1")).await;

        let res = invoker.invoke("summarize-call", InvokeOptions::default()).await;
        assert_eq!(
            res.error.as_deref(),
            Some("Edge function returned 401: still unauthorized")
        );
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_returns_original_error() {
        let auth = Arc::new(FakeAuthProvider::new().failing_refresh());
        let transport = Arc::new(FakeTransport::new(|_| Err(status(401, "jwt expired"))));
        let invoker = invoker(auth.clone(), transport.clone(), Some("t1")).await;

        let res = invoker.invoke("summarize-call", InvokeOptions::default()).await;
        assert_eq!(
            res.error.as_deref(),
            Some("Edge function returned 401: jwt expired")
        );
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_invokes_with_expired_token_share_one_refresh() {
        let auth = Arc::new(FakeAuthProvider::new().with_refresh_delay(Duration::from_millis(30)));
        let transport = Arc::new(
            FakeTransport::new(|req| {
                if req.headers["authorization"] == "Bearer expired" {
                    Err(status(401, "jwt expired"))
                } else {
                    Ok(json!({ "orders": [] }))
                }
            })
            .with_delay(Duration::from_millis(5)),
        );
        let invoker = invoker(auth.clone(), transport.clone(), Some("expired")).await;

        let a = tokio::spawn({
            let invoker = invoker.clone();
            async move { invoker.invoke("list-orders", InvokeOptions::default()).await }
        });
        let b = tokio::spawn({
            let invoker = invoker.clone();
            async move { invoker.invoke("list-orders", InvokeOptions::default()).await }
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(auth.refresh_calls(), 1);
        assert_eq!(transport.calls(), 4);
    }
}
