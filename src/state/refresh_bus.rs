use crate::types::{IpcErrorCode, IpcResult, RefreshResult};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Upper bound for a caller waiting on the refresh loop.
pub const REFRESH_WAIT_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// Fire-and-forget nudge, e.g. on startup.
    Nudge,
    /// A caller is waiting for the outcome.
    Explicit,
}

pub struct RefreshRequest {
    pub(crate) reason: RefreshReason,
    pub(crate) reply: Option<oneshot::Sender<IpcResult<RefreshResult>>>,
}

/// Handle for asking the background refresh loop to refresh out of schedule.
#[derive(Clone)]
pub struct RefreshBus {
    tx: mpsc::UnboundedSender<RefreshRequest>,
}

impl RefreshBus {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RefreshRequest>) -> Self {
        Self { tx }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn trigger(&self) {
        let request = RefreshRequest {
            reason: RefreshReason::Nudge,
            reply: None,
        };
        if self.tx.send(request).is_err() {
            tracing::debug!("refresh loop is not running; trigger dropped");
        }
    }

    pub async fn refresh_now(&self) -> IpcResult<RefreshResult> {
        self.refresh_within(REFRESH_WAIT_LIMIT).await
    }

    pub async fn refresh_within(&self, limit: Duration) -> IpcResult<RefreshResult> {
        let (reply, rx) = oneshot::channel();
        let request = RefreshRequest {
            reason: RefreshReason::Explicit,
            reply: Some(reply),
        };
        if self.tx.send(request).is_err() {
            return IpcResult::err(IpcErrorCode::Unknown, "Refresh loop is not available.");
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                IpcResult::err(IpcErrorCode::Unknown, "Refresh loop dropped the request.")
            }
            Err(_) => {
                IpcResult::err(IpcErrorCode::Remote, "Timed out waiting for session refresh.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_loop_reports_unavailable() {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = RefreshBus::new(tx);
        assert!(bus.is_running());
        drop(rx);
        assert!(!bus.is_running());
        assert!(!bus.refresh_now().await.is_ok());
        bus.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = RefreshBus::new(tx);
        let waiter = tokio::spawn(async move { bus.refresh_within(Duration::from_secs(2)).await });

        let request = rx.recv().await.unwrap();
        assert_eq!(request.reason, RefreshReason::Explicit);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let res = waiter.await.unwrap();
        assert!(!res.is_ok());
        drop(request);
    }
}
