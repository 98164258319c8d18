use crate::auth::{AuthError, AuthProvider};
use crate::invoker::{FunctionError, FunctionRequest, FunctionTransport};
use crate::roles::{RoleLookupError, RoleSource};
use crate::settings::SettingsStore;
use crate::state::{AppServices, AppState, RefreshRequest, SessionStore};
use crate::types::{FactorStatus, MfaChallenge, MfaEnrollment, MfaFactor, Session, SessionUser};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) fn session(user_id: &str, access_token: &str) -> Session {
    Session {
        access_token: access_token.to_string(),
        refresh_token: format!("refresh-{access_token}"),
        expires_at: Some(4_102_444_800),
        user: SessionUser {
            id: user_id.to_string(),
            email: Some(format!("{user_id}@example.test")),
        },
    }
}

#[derive(Default)]
pub(crate) struct FakeAuthProvider {
    refresh_delay: Duration,
    fail_refresh: bool,
    fail_sign_out: bool,
    no_expiry: bool,
    refresh_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

impl FakeAuthProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub(crate) fn failing_refresh(mut self) -> Self {
        self.fail_refresh = true;
        self
    }

    /// Refreshed sessions come back without `expires_at`.
    pub(crate) fn without_expiry(mut self) -> Self {
        self.no_expiry = true;
        self
    }

    pub(crate) fn failing_sign_out(mut self) -> Self {
        self.fail_sign_out = true;
        self
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }
}

fn unauthorized(message: &str) -> AuthError {
    AuthError::Api {
        status: 401,
        message: message.to_string(),
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    async fn sign_in_with_password(
        &self,
        email: &str,
        _password: &str,
    ) -> Result<Session, AuthError> {
        let user_id = email.split('@').next().unwrap_or(email);
        Ok(session(user_id, "signed-in"))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if self.fail_refresh {
            return Err(unauthorized("Invalid Refresh Token"));
        }
        let mut fresh = session("u1", &format!("fresh-{n}"));
        fresh.refresh_token = format!("{refresh_token}+{n}");
        if self.no_expiry {
            fresh.expires_at = None;
        }
        Ok(fresh)
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sign_out {
            return Err(AuthError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    async fn list_factors(&self, _access_token: &str) -> Result<Vec<MfaFactor>, AuthError> {
        Ok(vec![MfaFactor {
            id: "factor-1".to_string(),
            factor_type: "totp".to_string(),
            status: FactorStatus::Verified,
            friendly_name: None,
        }])
    }

    async fn enroll_totp(
        &self,
        _access_token: &str,
        _friendly_name: Option<&str>,
    ) -> Result<MfaEnrollment, AuthError> {
        Ok(MfaEnrollment {
            id: "factor-2".to_string(),
            qr_code: None,
            secret: Some("SECRET".to_string()),
            uri: None,
        })
    }

    async fn challenge_factor(
        &self,
        _access_token: &str,
        factor_id: &str,
    ) -> Result<MfaChallenge, AuthError> {
        Ok(MfaChallenge {
            id: format!("challenge-{factor_id}"),
            expires_at: None,
        })
    }

    async fn verify_factor(
        &self,
        access_token: &str,
        _factor_id: &str,
        _challenge_id: &str,
        code: &str,
    ) -> Result<Session, AuthError> {
        if code.len() != 6 {
            return Err(unauthorized("invalid code"));
        }
        Ok(session("u1", &format!("mfa-{access_token}")))
    }

    async fn unenroll_factor(
        &self,
        _access_token: &str,
        _factor_id: &str,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

type Responder = dyn Fn(&FunctionRequest) -> Result<Value, FunctionError> + Send + Sync;

pub(crate) struct FakeTransport {
    respond: Box<Responder>,
    delay: Duration,
    seen: Mutex<Vec<FunctionRequest>>,
}

impl FakeTransport {
    pub(crate) fn new(
        respond: impl Fn(&FunctionRequest) -> Result<Value, FunctionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Bearer tokens in call order.
    pub(crate) fn tokens(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.headers.get("authorization"))
            .map(|h| h.trim_start_matches("Bearer ").to_string())
            .collect()
    }
}

#[async_trait]
impl FunctionTransport for FakeTransport {
    async fn invoke(&self, request: FunctionRequest) -> Result<Value, FunctionError> {
        self.seen.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&request)
    }
}

#[derive(Default)]
pub(crate) struct FakeRoleSource {
    roles: HashMap<String, String>,
    failing: HashSet<String>,
    fetches: AtomicUsize,
}

impl FakeRoleSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_role(mut self, user_id: &str, role: &str) -> Self {
        self.roles.insert(user_id.to_string(), role.to_string());
        self
    }

    pub(crate) fn failing_for(mut self, user_id: &str) -> Self {
        self.failing.insert(user_id.to_string());
        self
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoleSource for FakeRoleSource {
    async fn fetch_role(
        &self,
        user_id: &str,
        _access_token: &str,
    ) -> Result<Option<String>, RoleLookupError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        if self.failing.contains(user_id) {
            return Err(RoleLookupError::Network("connection refused".to_string()));
        }
        Ok(self.roles.get(user_id).cloned())
    }
}

pub(crate) fn test_state() -> (AppState, mpsc::UnboundedReceiver<RefreshRequest>) {
    test_state_with(Arc::new(FakeAuthProvider::new()))
}

pub(crate) fn test_state_with(
    auth: Arc<FakeAuthProvider>,
) -> (AppState, mpsc::UnboundedReceiver<RefreshRequest>) {
    AppState::with_services(
        SettingsStore::in_memory(),
        AppServices {
            auth,
            transport: Arc::new(FakeTransport::new(|_| Ok(Value::Null))),
            role_source: Arc::new(FakeRoleSource::new().with_role("ops", "manager")),
            store: SessionStore::in_memory(),
        },
    )
}
