use crate::auth::AuthError;
use crate::invoker::{is_auth_error, InvokeOptions, NO_SESSION_MESSAGE};
use crate::roles::Capability;
use crate::settings::KEY_REMEMBER_SESSION;
use crate::state::{AppState, SessionStore, KEYRING_USER_SESSION};
use crate::types::{IpcErrorCode, IpcResult, MfaEnrollment, MfaFactor, SessionView};
use serde_json::Value;
use std::collections::BTreeMap;

fn auth_error<T>(e: AuthError) -> IpcResult<T> {
    if matches!(&e, AuthError::Api { message, .. } if message == NO_SESSION_MESSAGE) {
        return no_session();
    }
    let code = if e.is_unauthorized() {
        IpcErrorCode::Unauthorized
    } else {
        IpcErrorCode::Remote
    };
    IpcResult::err(code, e.to_string())
}

fn no_session<T>() -> IpcResult<T> {
    IpcResult::err(IpcErrorCode::NoSession, NO_SESSION_MESSAGE)
}

async fn current_view(state: &AppState) -> IpcResult<SessionView> {
    match state.session_view().await {
        Some(view) => IpcResult::ok(view),
        None => no_session(),
    }
}

pub async fn sign_in(
    state: &AppState,
    email: &str,
    password: &str,
    remember: bool,
) -> IpcResult<SessionView> {
    if email.trim().is_empty() || password.is_empty() {
        return IpcResult::err(IpcErrorCode::InvalidInput, "Email and password are required.");
    }
    if remember != state.remember_session() {
        // Takes effect for the next process; the current store keeps its mode.
        state.settings.set(KEY_REMEMBER_SESSION, remember);
    }
    if let Err(e) = state.sessions.sign_in_with_password(email, password).await {
        return auth_error(e);
    }
    current_view(state).await
}

pub async fn sign_out(state: &AppState) -> IpcResult<()> {
    state.sessions.sign_out().await;
    state.roles.resolve(None).await;
    IpcResult::ok(())
}

pub async fn forget(state: &AppState) -> IpcResult<()> {
    state.sessions.store().clear().await;
    if !state.remember_session() {
        // A previously remembered session may still sit in the keychain.
        SessionStore::with_keyring(KEYRING_USER_SESSION).clear().await;
    }
    state.roles.invalidate().await;
    state.settings.remove(KEY_REMEMBER_SESSION);
    IpcResult::ok(())
}

pub async fn status(state: &AppState) -> IpcResult<SessionView> {
    current_view(state).await
}

pub async fn refresh(state: &AppState) -> IpcResult<SessionView> {
    if state.sessions.get_current_session().await.is_none() {
        return no_session();
    }
    let result = state.sessions.safe_refresh_session().await;
    if !result.success {
        return IpcResult::err(IpcErrorCode::Unauthorized, "Session refresh failed.");
    }
    current_view(state).await
}

pub async fn can(state: &AppState, capability: &str) -> IpcResult<bool> {
    let name = capability.trim().replace('-', "_");
    let Some(capability) = Capability::ALL.into_iter().find(|c| c.as_str() == name) else {
        return IpcResult::err(
            IpcErrorCode::InvalidInput,
            format!("Unknown capability: {capability}"),
        );
    };
    IpcResult::ok(state.capabilities().await.allows(capability))
}

/// Parses `key=value` pairs given on the command line.
pub fn parse_headers(pairs: &[String]) -> Result<BTreeMap<String, String>, String> {
    pairs
        .iter()
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .or_else(|| pair.split_once(':'))
                .ok_or_else(|| format!("Header must be key=value: {pair}"))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(format!("Header must be key=value: {pair}"));
            }
            Ok((k.to_ascii_lowercase(), v.trim().to_string()))
        })
        .collect()
}

pub async fn invoke(
    state: &AppState,
    function: &str,
    body: Option<&str>,
    headers: &[String],
) -> IpcResult<Value> {
    let function = function.trim();
    if function.is_empty() {
        return IpcResult::err(IpcErrorCode::InvalidInput, "Function name is required.");
    }
    let body = match body.map(serde_json::from_str::<Value>).transpose() {
        Ok(body) => body,
        Err(e) => {
            return IpcResult::err(
                IpcErrorCode::InvalidInput,
                format!("Body is not valid JSON: {e}"),
            )
        }
    };
    let headers = match parse_headers(headers) {
        Ok(headers) => headers,
        Err(message) => return IpcResult::err(IpcErrorCode::InvalidInput, message),
    };

    let res = state
        .invoker
        .invoke(function, InvokeOptions { body, headers })
        .await;
    match res.error {
        None => IpcResult::ok(res.data.unwrap_or(Value::Null)),
        Some(message) if message == NO_SESSION_MESSAGE => no_session(),
        Some(message) if is_auth_error(&message) => {
            IpcResult::err(IpcErrorCode::Unauthorized, message)
        }
        Some(message) => IpcResult::err(IpcErrorCode::Remote, message),
    }
}

pub async fn mfa_factors(state: &AppState) -> IpcResult<Vec<MfaFactor>> {
    match state.sessions.mfa_list_factors().await {
        Ok(factors) => IpcResult::ok(factors),
        Err(e) => auth_error(e),
    }
}

pub async fn mfa_enroll(state: &AppState, friendly_name: Option<&str>) -> IpcResult<MfaEnrollment> {
    match state.sessions.mfa_enroll_totp(friendly_name).await {
        Ok(enrollment) => IpcResult::ok(enrollment),
        Err(e) => auth_error(e),
    }
}

pub async fn mfa_verify(state: &AppState, factor_id: &str, code: &str) -> IpcResult<SessionView> {
    if let Err(e) = state.sessions.mfa_verify(factor_id, code).await {
        return auth_error(e);
    }
    current_view(state).await
}

pub async fn mfa_unenroll(state: &AppState, factor_id: &str) -> IpcResult<()> {
    match state.sessions.mfa_unenroll(factor_id).await {
        Ok(()) => IpcResult::ok(()),
        Err(e) => auth_error(e),
    }
}
