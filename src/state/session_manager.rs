//! Session lifecycle: single-flight token refresh, session lookup and the
//! sign-in / sign-out / MFA glue around the hosted-auth provider.
//!
//! Concurrent callers of [`SessionManager::safe_refresh_session`] share one
//! network refresh. The shared result stays visible for a short settle window
//! after completion so near-simultaneous callers land on the same outcome.

use super::session_store::SessionStore;
use crate::auth::{AuthError, AuthProvider};
use crate::invoker::NO_SESSION_MESSAGE;
use crate::redact::redact_secrets;
use crate::types::{MfaEnrollment, MfaFactor, RefreshResult, Session};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

type InFlight = watch::Receiver<Option<RefreshResult>>;

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `true` when the session is missing, has no expiry, or expires within
/// `threshold_seconds` of `now`.
pub fn is_token_expiring_soon_at(
    session: Option<&Session>,
    threshold_seconds: i64,
    now: i64,
) -> bool {
    let Some(expires_at) = session.and_then(|s| s.expires_at) else {
        return true;
    };
    expires_at <= now.saturating_add(threshold_seconds)
}

pub fn is_token_expiring_soon(session: Option<&Session>, threshold_seconds: i64) -> bool {
    is_token_expiring_soon_at(session, threshold_seconds, now_unix())
}

#[derive(Clone)]
pub struct SessionManager {
    auth: Arc<dyn AuthProvider>,
    store: SessionStore,
    settle_delay: Duration,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthProvider>, store: SessionStore) -> Self {
        Self::with_settle_delay(auth, store, DEFAULT_SETTLE_DELAY)
    }

    pub fn with_settle_delay(
        auth: Arc<dyn AuthProvider>,
        store: SessionStore,
        settle_delay: Duration,
    ) -> Self {
        Self {
            auth,
            store,
            settle_delay,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Returns the stored session without touching the network.
    pub async fn get_current_session(&self) -> Option<Arc<Session>> {
        match self.store.current().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "session lookup failed");
                None
            }
        }
    }

    pub async fn safe_refresh_session(&self) -> RefreshResult {
        let mut rx = {
            let mut guard = self.in_flight.lock().await;
            match guard.as_ref() {
                Some(rx) => {
                    tracing::debug!("joining in-flight session refresh");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *guard = Some(rx.clone());
                    self.spawn_refresh(tx);
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(RefreshResult::failed)
    }

    fn spawn_refresh(&self, tx: watch::Sender<Option<RefreshResult>>) {
        let auth = self.auth.clone();
        let store = self.store.clone();
        let in_flight = self.in_flight.clone();
        let settle_delay = self.settle_delay;

        // Runs detached so the refresh completes even if the first caller goes away.
        tokio::spawn(async move {
            let result = refresh_once(auth.as_ref(), &store).await;
            tx.send_replace(Some(result));
            tokio::time::sleep(settle_delay).await;
            in_flight.lock().await.take();
        });
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Arc<Session>, AuthError> {
        let session = self.auth.sign_in_with_password(email.trim(), password).await?;
        tracing::info!(user_id = %session.user.id, "signed in");
        Ok(self.store.replace(session).await)
    }

    /// Remote logout is best-effort; the local session is always dropped.
    pub async fn sign_out(&self) {
        if let Some(session) = self.get_current_session().await {
            if let Err(e) = self.auth.sign_out(&session.access_token).await {
                tracing::warn!(error = %redact_secrets(&e.to_string()), "remote sign-out failed");
            }
        }
        self.store.clear().await;
        tracing::info!("signed out");
    }

    async fn require_session(&self) -> Result<Arc<Session>, AuthError> {
        self.get_current_session().await.ok_or(AuthError::Api {
            status: 401,
            message: NO_SESSION_MESSAGE.to_string(),
        })
    }

    pub async fn mfa_list_factors(&self) -> Result<Vec<MfaFactor>, AuthError> {
        let session = self.require_session().await?;
        self.auth.list_factors(&session.access_token).await
    }

    pub async fn mfa_enroll_totp(
        &self,
        friendly_name: Option<&str>,
    ) -> Result<MfaEnrollment, AuthError> {
        let session = self.require_session().await?;
        self.auth
            .enroll_totp(&session.access_token, friendly_name)
            .await
    }

    /// Challenges `factor_id` and verifies `code`; the upgraded session replaces the current one.
    pub async fn mfa_verify(&self, factor_id: &str, code: &str) -> Result<Arc<Session>, AuthError> {
        let session = self.require_session().await?;
        let challenge = self
            .auth
            .challenge_factor(&session.access_token, factor_id)
            .await?;
        let upgraded = self
            .auth
            .verify_factor(&session.access_token, factor_id, &challenge.id, code)
            .await?;
        tracing::info!(factor_id, "mfa factor verified");
        Ok(self.store.replace(upgraded).await)
    }

    pub async fn mfa_unenroll(&self, factor_id: &str) -> Result<(), AuthError> {
        let session = self.require_session().await?;
        self.auth
            .unenroll_factor(&session.access_token, factor_id)
            .await?;
        tracing::info!(factor_id, "mfa factor removed");
        Ok(())
    }
}

async fn refresh_once(auth: &dyn AuthProvider, store: &SessionStore) -> RefreshResult {
    let current = match store.current().await {
        Ok(current) => current,
        Err(e) => {
            tracing::warn!(error = %e, "cannot refresh: session lookup failed");
            return RefreshResult::failed();
        }
    };
    let Some(current) = current.filter(|s| !s.refresh_token.is_empty()) else {
        tracing::debug!("cannot refresh: no stored refresh token");
        return RefreshResult::failed();
    };

    match auth.refresh_session(&current.refresh_token).await {
        Ok(session) => match store.replace_if_current(&current, session).await {
            Some(session) => {
                tracing::debug!(
                    user_id = %session.user.id,
                    expires_at = ?session.expires_at,
                    "session refreshed"
                );
                RefreshResult::succeeded(session)
            }
            None => {
                tracing::info!(
                    user_id = %current.user.id,
                    "session changed during refresh; discarding refreshed tokens"
                );
                RefreshResult::failed()
            }
        },
        Err(e) => {
            tracing::warn!(error = %redact_secrets(&e.to_string()), "session refresh failed");
            RefreshResult::failed()
        }
    }
}
