use crate::redact::redact_secrets;
use crate::types::{FactorStatus, MfaChallenge, MfaEnrollment, MfaFactor, Session, SessionUser};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;

const AUTH_PATH: &str = "/auth/v1";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
  #[error("network error: {0}")]
  Network(String),
  #[error("Auth API error ({status}): {message}")]
  Api { status: u16, message: String },
  #[error("invalid auth response: {0}")]
  InvalidResponse(String),
}

impl AuthError {
  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Self::Api { status: 401 | 403, .. })
  }
}

/// The hosted-auth boundary. Every method is a single remote call.
#[async_trait]
pub trait AuthProvider: Send + Sync {
  async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError>;

  async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError>;

  async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;

  async fn list_factors(&self, access_token: &str) -> Result<Vec<MfaFactor>, AuthError>;

  async fn enroll_totp(
    &self,
    access_token: &str,
    friendly_name: Option<&str>,
  ) -> Result<MfaEnrollment, AuthError>;

  async fn challenge_factor(
    &self,
    access_token: &str,
    factor_id: &str,
  ) -> Result<MfaChallenge, AuthError>;

  async fn verify_factor(
    &self,
    access_token: &str,
    factor_id: &str,
    challenge_id: &str,
    code: &str,
  ) -> Result<Session, AuthError>;

  async fn unenroll_factor(&self, access_token: &str, factor_id: &str) -> Result<(), AuthError>;
}

fn now_unix() -> i64 {
  OffsetDateTime::now_utc().unix_timestamp()
}

/// Pulls a human readable message out of a hosted-platform error body.
pub(crate) fn error_message_from_body(body: &str) -> Option<String> {
  let trimmed = body.trim();
  if trimmed.is_empty() {
    return None;
  }
  let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
    return Some(trimmed.chars().take(300).collect());
  };
  for key in ["error_description", "msg", "message", "error"] {
    if let Some(s) = json.get(key).and_then(|v| v.as_str()) {
      let s = s.trim();
      if !s.is_empty() {
        return Some(s.to_string());
      }
    }
  }
  None
}

#[derive(Debug, Deserialize)]
struct UserResponse {
  id: String,
  #[serde(default)]
  email: Option<String>,
  #[serde(default)]
  factors: Option<Vec<FactorResponse>>,
}

#[derive(Debug, Deserialize)]
struct FactorResponse {
  id: String,
  factor_type: String,
  status: FactorStatus,
  #[serde(default)]
  friendly_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: String,
  refresh_token: String,
  #[serde(default)]
  expires_in: Option<i64>,
  #[serde(default)]
  expires_at: Option<i64>,
  user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
  id: String,
  #[serde(default)]
  totp: Option<TotpResponse>,
}

#[derive(Debug, Deserialize)]
struct TotpResponse {
  #[serde(default)]
  qr_code: Option<String>,
  #[serde(default)]
  secret: Option<String>,
  #[serde(default)]
  uri: Option<String>,
}

fn session_user(user: UserResponse) -> SessionUser {
  SessionUser {
    id: user.id,
    email: user
      .email
      .map(|e| e.trim().to_string())
      .filter(|e| !e.is_empty()),
  }
}

fn factor(f: FactorResponse) -> MfaFactor {
  MfaFactor {
    id: f.id,
    factor_type: f.factor_type,
    status: f.status,
    friendly_name: f.friendly_name.filter(|n| !n.trim().is_empty()),
  }
}

pub(crate) fn parse_token_response(json: Value, now: i64) -> Result<Session, AuthError> {
  let parsed: TokenResponse =
    serde_json::from_value(json).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
  if parsed.access_token.trim().is_empty() {
    return Err(AuthError::InvalidResponse("empty access token".to_string()));
  }
  let expires_at = parsed
    .expires_at
    .or_else(|| parsed.expires_in.map(|secs| now + secs));

  Ok(Session {
    access_token: parsed.access_token,
    refresh_token: parsed.refresh_token,
    expires_at,
    user: session_user(parsed.user),
  })
}

pub struct HostedAuthClient {
  http: reqwest::Client,
  base_url: String,
  anon_key: String,
}

impl HostedAuthClient {
  pub fn new(project_url: &str, anon_key: &str) -> Result<Self, AuthError> {
    Ok(Self {
      http: reqwest::Client::builder()
        .build()
        .map_err(|e| AuthError::Network(e.to_string()))?,
      base_url: format!("{}{AUTH_PATH}", project_url.trim_end_matches('/')),
      anon_key: anon_key.to_string(),
    })
  }

  fn build_headers(&self, access_token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&self.anon_key) {
      headers.insert(HeaderName::from_static("apikey"), value);
    }
    if let Some(token) = access_token {
      if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(AUTHORIZATION, value);
      }
    }
    headers
  }

  async fn send(&self, builder: RequestBuilder) -> Result<Value, AuthError> {
    let res = builder
      .send()
      .await
      .map_err(|e| AuthError::Network(redact_secrets(&e.to_string()).into_owned()))?;

    let status = res.status();
    let text = res
      .text()
      .await
      .map_err(|e| AuthError::Network(redact_secrets(&e.to_string()).into_owned()))?;

    if !status.is_success() {
      let message = error_message_from_body(&text)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
      tracing::debug!(status = status.as_u16(), "auth request rejected");
      return Err(AuthError::Api {
        status: status.as_u16(),
        message: redact_secrets(&message).into_owned(),
      });
    }

    if text.trim().is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| AuthError::InvalidResponse(e.to_string()))
  }

  async fn token_grant(&self, grant_type: &str, body: Value) -> Result<Session, AuthError> {
    let url = format!(
      "{}/token?grant_type={}",
      self.base_url,
      urlencoding::encode(grant_type)
    );
    let json = self
      .send(self.http.post(url).headers(self.build_headers(None)).json(&body))
      .await?;
    parse_token_response(json, now_unix())
  }

  fn factor_url(&self, factor_id: &str, suffix: &str) -> String {
    format!(
      "{}/factors/{}{suffix}",
      self.base_url,
      urlencoding::encode(factor_id)
    )
  }
}

#[async_trait]
impl AuthProvider for HostedAuthClient {
  async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
    self
      .token_grant("password", json!({ "email": email, "password": password }))
      .await
  }

  async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
    self
      .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
      .await
  }

  async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
    let url = format!("{}/logout", self.base_url);
    self
      .send(self.http.post(url).headers(self.build_headers(Some(access_token))))
      .await?;
    Ok(())
  }

  async fn list_factors(&self, access_token: &str) -> Result<Vec<MfaFactor>, AuthError> {
    let url = format!("{}/user", self.base_url);
    let json = self
      .send(self.http.get(url).headers(self.build_headers(Some(access_token))))
      .await?;
    let user: UserResponse =
      serde_json::from_value(json).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    Ok(user.factors.unwrap_or_default().into_iter().map(factor).collect())
  }

  async fn enroll_totp(
    &self,
    access_token: &str,
    friendly_name: Option<&str>,
  ) -> Result<MfaEnrollment, AuthError> {
    let url = format!("{}/factors", self.base_url);
    let mut body = json!({ "factor_type": "totp" });
    if let Some(name) = friendly_name.map(str::trim).filter(|n| !n.is_empty()) {
      body["friendly_name"] = json!(name);
    }
    let json = self
      .send(
        self
          .http
          .post(url)
          .headers(self.build_headers(Some(access_token)))
          .json(&body),
      )
      .await?;
    let enrolled: EnrollResponse =
      serde_json::from_value(json).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    let totp = enrolled.totp.unwrap_or(TotpResponse {
      qr_code: None,
      secret: None,
      uri: None,
    });
    Ok(MfaEnrollment {
      id: enrolled.id,
      qr_code: totp.qr_code,
      secret: totp.secret,
      uri: totp.uri,
    })
  }

  async fn challenge_factor(
    &self,
    access_token: &str,
    factor_id: &str,
  ) -> Result<MfaChallenge, AuthError> {
    let url = self.factor_url(factor_id, "/challenge");
    let json = self
      .send(self.http.post(url).headers(self.build_headers(Some(access_token))))
      .await?;
    let Some(id) = json.get("id").and_then(|v| v.as_str()) else {
      return Err(AuthError::InvalidResponse("challenge without id".to_string()));
    };
    Ok(MfaChallenge {
      id: id.to_string(),
      expires_at: json.get("expires_at").and_then(|v| v.as_i64()),
    })
  }

  async fn verify_factor(
    &self,
    access_token: &str,
    factor_id: &str,
    challenge_id: &str,
    code: &str,
  ) -> Result<Session, AuthError> {
    let url = self.factor_url(factor_id, "/verify");
    let json = self
      .send(
        self
          .http
          .post(url)
          .headers(self.build_headers(Some(access_token)))
          .json(&json!({ "challenge_id": challenge_id, "code": code.trim() })),
      )
      .await?;
    parse_token_response(json, now_unix())
  }

  async fn unenroll_factor(&self, access_token: &str, factor_id: &str) -> Result<(), AuthError> {
    let url = self.factor_url(factor_id, "");
    self
      .send(self.http.delete(url).headers(self.build_headers(Some(access_token))))
      .await?;
    Ok(())
  }
}
