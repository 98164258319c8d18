use super::{
    is_token_expiring_soon, RefreshBus, RefreshRequest, SessionManager, SessionStore,
    KEYRING_USER_SESSION,
};
use crate::auth::{AuthError, AuthProvider, HostedAuthClient};
use crate::invoker::{AuthenticatedInvoker, FunctionError, FunctionTransport, HttpFunctionTransport};
use crate::roles::{CapabilitySet, RestRoleSource, RoleLookupError, RoleResolver, RoleSource};
use crate::settings::{
    SettingsError, SettingsStore, ENV_ANON_KEY, ENV_PROJECT_URL, KEY_AUTO_REFRESH_ENABLED,
    KEY_EXPIRY_THRESHOLD_SECONDS, KEY_REFRESH_SETTLE_MS, KEY_REMEMBER_SESSION,
};
use crate::types::SessionView;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(
        "project url is not configured; set {} or `projectUrl` in the settings file",
        ENV_PROJECT_URL
    )]
    MissingProjectUrl,
    #[error("anon key is not configured; set {} or `anonKey` in the settings file", ENV_ANON_KEY)]
    MissingAnonKey,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Function(#[from] FunctionError),
    #[error(transparent)]
    Roles(#[from] RoleLookupError),
}

pub struct AppServices {
    pub auth: Arc<dyn AuthProvider>,
    pub transport: Arc<dyn FunctionTransport>,
    pub role_source: Arc<dyn RoleSource>,
    pub store: SessionStore,
}

#[derive(Clone)]
pub struct AppState {
    pub settings: SettingsStore,
    pub sessions: SessionManager,
    pub invoker: AuthenticatedInvoker,
    pub roles: Arc<RoleResolver>,
    pub refresh: RefreshBus,
}

impl AppState {
    /// Wires the hosted clients from settings. The receiver feeds the refresh loop.
    pub fn from_settings(
        settings: SettingsStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RefreshRequest>), AppError> {
        let project_url = settings.project_url().ok_or(AppError::MissingProjectUrl)?;
        let anon_key = settings.anon_key().ok_or(AppError::MissingAnonKey)?;

        let store = if settings.get_bool(KEY_REMEMBER_SESSION, false) {
            SessionStore::with_keyring(KEYRING_USER_SESSION)
        } else {
            SessionStore::in_memory()
        };

        let services = AppServices {
            auth: Arc::new(HostedAuthClient::new(&project_url, &anon_key)?),
            transport: Arc::new(HttpFunctionTransport::new(&project_url, &anon_key)?),
            role_source: Arc::new(RestRoleSource::new(&project_url, &anon_key)?),
            store,
        };
        tracing::debug!(project_url = %project_url, "hosted clients configured");
        Ok(Self::with_services(settings, services))
    }

    pub fn with_services(
        settings: SettingsStore,
        services: AppServices,
    ) -> (Self, mpsc::UnboundedReceiver<RefreshRequest>) {
        let settle_delay = Duration::from_millis(settings.get_u64(KEY_REFRESH_SETTLE_MS, 100));
        let sessions =
            SessionManager::with_settle_delay(services.auth, services.store, settle_delay);
        let invoker = AuthenticatedInvoker::new(sessions.clone(), services.transport);
        let roles = Arc::new(RoleResolver::new(services.role_source));

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Self {
            settings,
            sessions,
            invoker,
            roles,
            refresh: RefreshBus::new(tx),
        };
        (state, rx)
    }

    pub fn expiry_threshold_seconds(&self) -> i64 {
        let secs = self.settings.get_u64(KEY_EXPIRY_THRESHOLD_SECONDS, 60);
        i64::try_from(secs).unwrap_or(i64::MAX)
    }

    pub fn auto_refresh_enabled(&self) -> bool {
        self.settings.get_bool(KEY_AUTO_REFRESH_ENABLED, true)
    }

    pub fn remember_session(&self) -> bool {
        self.settings.get_bool(KEY_REMEMBER_SESSION, false)
    }

    pub async fn capabilities(&self) -> CapabilitySet {
        let session = self.sessions.get_current_session().await;
        self.roles.resolve(session.as_deref()).await
    }

    pub async fn session_view(&self) -> Option<SessionView> {
        let session = self.sessions.get_current_session().await?;
        let caps = self.roles.resolve(Some(session.as_ref())).await;
        Some(SessionView {
            user_id: session.user.id.clone(),
            email: session.user.email.clone(),
            expires_at: session.expires_at,
            expiring_soon: is_token_expiring_soon(
                Some(session.as_ref()),
                self.expiry_threshold_seconds(),
            ),
            role: caps.role().map(|r| r.as_str().to_string()),
            capabilities: caps.flags(),
            persistence_available: self.sessions.store().is_persistence_available(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{Capability, Role};
    use crate::settings::KEY_PROJECT_URL;
    use crate::test_support::test_state;

    #[test]
    fn from_settings_requires_project_coordinates() {
        if std::env::var(ENV_PROJECT_URL).is_ok() {
            return;
        }
        let settings = SettingsStore::in_memory();
        assert!(matches!(
            AppState::from_settings(settings.clone()),
            Err(AppError::MissingProjectUrl)
        ));
        settings.set(KEY_PROJECT_URL, "https://project.example.test");
        if std::env::var(ENV_ANON_KEY).is_err() {
            assert!(matches!(
                AppState::from_settings(settings),
                Err(AppError::MissingAnonKey)
            ));
        }
    }

    #[tokio::test]
    async fn session_view_reports_role_and_capabilities() {
        let (state, _rx) = test_state();
        assert!(state.session_view().await.is_none());

        state
            .sessions
            .sign_in_with_password("ops@example.test", "pw")
            .await
            .unwrap();
        let view = state.session_view().await.unwrap();
        assert_eq!(view.user_id, "ops");
        assert_eq!(view.role.as_deref(), Some("manager"));
        assert_eq!(view.capabilities["delete_orders"], true);
        assert_eq!(view.capabilities["assign_roles"], false);
        assert!(!view.expiring_soon);

        let caps = state.capabilities().await;
        assert_eq!(caps.role(), Some(Role::Manager));
        assert!(caps.allows(Capability::UploadFiles));
    }
}
