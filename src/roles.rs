//! Role lookup and the role → capability table.
//!
//! A user's role is fetched once per user id and cached until the identity
//! changes. Lookup errors resolve to "no role", which denies every capability.

use crate::auth::error_message_from_body;
use crate::redact::redact_secrets;
use crate::types::Session;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

const REST_PATH: &str = "/rest/v1";
const ROLES_TABLE: &str = "user_roles";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Manager,
    Staff,
    Viewer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Owner,
        Role::Admin,
        Role::Manager,
        Role::Staff,
        Role::Viewer,
    ];

    /// Assigned to authenticated users that have no role row yet.
    pub const LOWEST: Role = Role::Viewer;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Staff => "staff",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownRole(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ViewDashboard,
    ViewAnalytics,
    ViewOrders,
    EditOrders,
    DeleteOrders,
    UploadFiles,
    DeleteFiles,
    SendSms,
    ViewSmsLogs,
    ViewAuditLogs,
    ManageUsers,
    AssignRoles,
    ManageSettings,
}

impl Capability {
    pub const ALL: [Capability; 13] = [
        Capability::ViewDashboard,
        Capability::ViewAnalytics,
        Capability::ViewOrders,
        Capability::EditOrders,
        Capability::DeleteOrders,
        Capability::UploadFiles,
        Capability::DeleteFiles,
        Capability::SendSms,
        Capability::ViewSmsLogs,
        Capability::ViewAuditLogs,
        Capability::ManageUsers,
        Capability::AssignRoles,
        Capability::ManageSettings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewDashboard => "view_dashboard",
            Self::ViewAnalytics => "view_analytics",
            Self::ViewOrders => "view_orders",
            Self::EditOrders => "edit_orders",
            Self::DeleteOrders => "delete_orders",
            Self::UploadFiles => "upload_files",
            Self::DeleteFiles => "delete_files",
            Self::SendSms => "send_sms",
            Self::ViewSmsLogs => "view_sms_logs",
            Self::ViewAuditLogs => "view_audit_logs",
            Self::ManageUsers => "manage_users",
            Self::AssignRoles => "assign_roles",
            Self::ManageSettings => "manage_settings",
        }
    }

    /// The capability table. Each capability lists its roles explicitly;
    /// there is no inheritance between roles.
    pub fn granted_to(&self) -> &'static [Role] {
        use Role::*;
        match self {
            Self::ViewDashboard => &[Owner, Admin, Manager, Staff, Viewer],
            Self::ViewAnalytics => &[Owner, Admin, Manager, Staff, Viewer],
            Self::ViewOrders => &[Owner, Admin, Manager, Staff, Viewer],
            Self::EditOrders => &[Owner, Admin, Manager, Staff],
            Self::DeleteOrders => &[Owner, Admin, Manager],
            Self::UploadFiles => &[Owner, Admin, Manager],
            Self::DeleteFiles => &[Owner, Admin],
            Self::SendSms => &[Owner, Admin, Manager, Staff],
            Self::ViewSmsLogs => &[Owner, Admin, Manager],
            Self::ViewAuditLogs => &[Owner, Admin],
            Self::ManageUsers => &[Owner, Admin],
            Self::AssignRoles => &[Owner],
            Self::ManageSettings => &[Owner, Admin],
        }
    }
}

/// Capabilities derived from a resolved role. `role: None` denies everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    role: Option<Role>,
}

impl CapabilitySet {
    pub fn none() -> Self {
        Self { role: None }
    }

    pub fn for_role(role: Option<Role>) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.role
            .is_some_and(|role| capability.granted_to().contains(&role))
    }

    pub fn granted(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.allows(*c))
            .collect()
    }

    pub fn flags(&self) -> BTreeMap<String, bool> {
        Capability::ALL
            .into_iter()
            .map(|c| (c.as_str().to_string(), self.allows(c)))
            .collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoleLookupError {
    #[error("network error: {0}")]
    Network(String),
    #[error("role lookup failed ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("invalid role response: {0}")]
    InvalidResponse(String),
}

/// Reads the `role` column of the caller's `user_roles` row.
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn fetch_role(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<String>, RoleLookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleState {
    Uninitialized,
    Loading { user_id: String },
    Resolved {
        user_id: String,
        role: Option<Role>,
    },
}

pub struct RoleResolver {
    source: Arc<dyn RoleSource>,
    state: Mutex<RoleState>,
}

impl RoleResolver {
    pub fn new(source: Arc<dyn RoleSource>) -> Self {
        Self {
            source,
            state: Mutex::new(RoleState::Uninitialized),
        }
    }

    pub async fn state(&self) -> RoleState {
        self.state.lock().await.clone()
    }

    pub async fn invalidate(&self) {
        *self.state.lock().await = RoleState::Uninitialized;
    }

    /// Resolves capabilities for `session`, fetching only when the user id changed.
    ///
    /// The state lock is held across the fetch so concurrent callers for the
    /// same identity wait for the first lookup instead of issuing their own.
    pub async fn resolve(&self, session: Option<&Session>) -> CapabilitySet {
        let mut state = self.state.lock().await;

        let Some(session) = session else {
            *state = RoleState::Uninitialized;
            return CapabilitySet::none();
        };
        let user_id = session.user.id.as_str();

        if let RoleState::Resolved {
            user_id: resolved,
            role,
        } = &*state
        {
            if resolved == user_id {
                return CapabilitySet::for_role(*role);
            }
        }

        *state = RoleState::Loading {
            user_id: user_id.to_string(),
        };
        let role = self.lookup(user_id, &session.access_token).await;
        *state = RoleState::Resolved {
            user_id: user_id.to_string(),
            role,
        };
        CapabilitySet::for_role(role)
    }

    async fn lookup(&self, user_id: &str, access_token: &str) -> Option<Role> {
        match self.source.fetch_role(user_id, access_token).await {
            Ok(Some(raw)) => match raw.parse::<Role>() {
                Ok(role) => {
                    tracing::debug!(user_id, %role, "role resolved");
                    Some(role)
                }
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "denying all capabilities");
                    None
                }
            },
            Ok(None) => {
                tracing::info!(user_id, role = %Role::LOWEST, "no role row; using lowest role");
                Some(Role::LOWEST)
            }
            Err(e) => {
                tracing::warn!(
                    user_id,
                    error = %redact_secrets(&e.to_string()),
                    "role lookup failed; denying all capabilities"
                );
                None
            }
        }
    }
}

pub struct RestRoleSource {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl RestRoleSource {
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self, RoleLookupError> {
        Ok(Self {
            http: reqwest::Client::builder()
                .build()
                .map_err(|e| RoleLookupError::Network(e.to_string()))?,
            base_url: format!("{}{REST_PATH}", project_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
        })
    }

    fn build_headers(&self, access_token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.anon_key) {
            headers.insert(HeaderName::from_static("apikey"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {access_token}")) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }
}

pub(crate) fn parse_role_rows(json: &Value) -> Result<Option<String>, RoleLookupError> {
    let Some(rows) = json.as_array() else {
        return Err(RoleLookupError::InvalidResponse(
            "expected an array of rows".to_string(),
        ));
    };
    Ok(rows
        .first()
        .and_then(|row| row.get("role"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

#[async_trait]
impl RoleSource for RestRoleSource {
    async fn fetch_role(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<String>, RoleLookupError> {
        let url = format!(
            "{}/{ROLES_TABLE}?select=role&user_id=eq.{}&limit=1",
            self.base_url,
            urlencoding::encode(user_id)
        );
        let res = self
            .http
            .get(url)
            .headers(self.build_headers(access_token))
            .send()
            .await
            .map_err(|e| RoleLookupError::Network(redact_secrets(&e.to_string()).into_owned()))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| RoleLookupError::Network(redact_secrets(&e.to_string()).into_owned()))?;
        if !status.is_success() {
            return Err(RoleLookupError::Api {
                status: status.as_u16(),
                message: error_message_from_body(&text).unwrap_or_default(),
            });
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| RoleLookupError::InvalidResponse(e.to_string()))?;
        parse_role_rows(&json)
    }
}
