use super::policy::{compute_next_refresh_delay_ms, compute_retry_delay_ms};
use crate::state::{is_token_expiring_soon, AppState, RefreshRequest};
use crate::types::{IpcErrorCode, IpcResult, RefreshResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consecutive outcomes that push the next attempt further out.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    /// Successful refreshes that still came back without an expiry.
    unbounded: u32,
}

impl Backoff {
    fn retry_delay_ms(&self) -> Option<u64> {
        if self.failures > 0 {
            return Some(compute_retry_delay_ms(self.failures));
        }
        if self.unbounded > 0 {
            return Some(compute_retry_delay_ms(self.unbounded));
        }
        None
    }
}

async fn refresh_once(state: &AppState, backoff: &mut Backoff) -> IpcResult<RefreshResult> {
    let result = state.sessions.safe_refresh_session().await;
    if let Some(session) = result.session.as_ref().filter(|_| result.success) {
        backoff.failures = 0;
        if session.expires_at.is_none() {
            backoff.unbounded = backoff.unbounded.saturating_add(1);
            tracing::warn!(
                retry_in_ms = compute_retry_delay_ms(backoff.unbounded),
                "refreshed session has no expiry; backing off"
            );
        } else {
            backoff.unbounded = 0;
        }
        return IpcResult::ok(result);
    }

    if state.sessions.store().peek().is_none() {
        *backoff = Backoff::default();
        return IpcResult::err(IpcErrorCode::NoSession, "No authenticated session");
    }

    backoff.failures = backoff.failures.saturating_add(1);
    tracing::warn!(
        consecutive_failures = backoff.failures,
        retry_in_ms = compute_retry_delay_ms(backoff.failures),
        "background session refresh failed"
    );
    IpcResult::err(IpcErrorCode::Unauthorized, "Session refresh failed.")
}

fn next_delay_ms(state: &AppState, backoff: &Backoff) -> Option<u64> {
    if let Some(delay) = backoff.retry_delay_ms() {
        return Some(delay);
    }
    if !state.auto_refresh_enabled() {
        return None;
    }
    compute_next_refresh_delay_ms(
        state.sessions.store().peek().as_deref(),
        state.expiry_threshold_seconds(),
    )
}

async fn sleep_for(delay_ms: Option<u64>) {
    match delay_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Keeps the stored session fresh until aborted or the request channel closes.
///
/// Explicit requests always refresh. Timer wakeups refresh only when the token
/// is inside the expiry threshold. Session replacement recomputes the timer.
pub fn spawn_refresh_loop(
    state: AppState,
    mut rx: mpsc::UnboundedReceiver<RefreshRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut session_rx = state.sessions.store().subscribe();
        let mut backoff = Backoff::default();

        loop {
            let delay_ms = next_delay_ms(&state, &backoff);
            tracing::trace!(?delay_ms, ?backoff, "refresh loop waiting");

            tokio::select! {
              req = rx.recv() => {
                let Some(req) = req else { break };
                tracing::debug!(reason = ?req.reason, "refresh requested");
                let result = refresh_once(&state, &mut backoff).await;
                if let Some(reply) = req.reply {
                  let _ = reply.send(result);
                }
              }
              changed = session_rx.changed() => {
                if changed.is_err() { break; }
                match session_rx.borrow_and_update().as_deref() {
                  None => backoff = Backoff::default(),
                  Some(session) if session.expires_at.is_some() => backoff.unbounded = 0,
                  Some(_) => {}
                }
              }
              _ = sleep_for(delay_ms) => {
                let current = state.sessions.get_current_session().await;
                let due = backoff.retry_delay_ms().is_some()
                  || is_token_expiring_soon(current.as_deref(), state.expiry_threshold_seconds());
                if current.is_some() && due {
                  let _ = refresh_once(&state, &mut backoff).await;
                }
              }
            }
        }

        tracing::debug!("refresh loop stopped");
    })
}
