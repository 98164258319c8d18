use crate::types::Session;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

const KEYRING_SERVICE: &str = "com.softaworks.callboard";
pub const KEYRING_USER_SESSION: &str = "dashboard_session";

pub type SharedSession = Option<Arc<Session>>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("OS keychain/secret service is unavailable")]
    Unavailable,
}

/// Holds the current session and broadcasts every replacement.
///
/// The in-memory value is authoritative. When a keyring user is configured the
/// session is mirrored to the OS secret store so a later process can restore it.
#[derive(Clone)]
pub struct SessionStore {
    keyring_user: Option<&'static str>,
    tx: Arc<watch::Sender<SharedSession>>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            keyring_user: None,
            tx: Arc::new(tx),
        }
    }

    pub fn with_keyring(user: &'static str) -> Self {
        Self {
            keyring_user: Some(user),
            ..Self::in_memory()
        }
    }

    fn entry(&self) -> Option<Result<keyring::Entry, keyring::Error>> {
        self.keyring_user
            .map(|user| keyring::Entry::new(KEYRING_SERVICE, user))
    }

    pub fn is_persistence_available(&self) -> bool {
        let Some(Ok(entry)) = self.entry() else {
            return false;
        };

        match entry.get_password() {
            Ok(_) => true,
            Err(keyring::Error::NoEntry) => true,
            Err(keyring::Error::BadEncoding(_)) => true,
            Err(keyring::Error::Ambiguous(_)) => true,
            Err(keyring::Error::NoStorageAccess(_)) => false,
            Err(keyring::Error::PlatformFailure(_)) => false,
            Err(_) => false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SharedSession> {
        self.tx.subscribe()
    }

    /// The in-memory session, or the persisted one if memory is empty.
    pub async fn current(&self) -> Result<SharedSession, SessionStoreError> {
        if let Some(session) = self.tx.borrow().clone() {
            return Ok(Some(session));
        }

        let Some(entry) = self.entry() else {
            return Ok(None);
        };
        let entry = entry.map_err(|_| SessionStoreError::Unavailable)?;

        let raw = match entry.get_password() {
            Ok(raw) => raw,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(keyring::Error::NoStorageAccess(_)) => return Err(SessionStoreError::Unavailable),
            Err(keyring::Error::PlatformFailure(_)) => return Err(SessionStoreError::Unavailable),
            Err(_) => return Ok(None),
        };

        match serde_json::from_str::<Session>(raw.trim()) {
            Ok(session) => {
                let session = Arc::new(session);
                tracing::debug!(user_id = %session.user.id, "restored persisted session");
                self.publish(Some(session.clone()));
                Ok(Some(session))
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable persisted session");
                Ok(None)
            }
        }
    }

    /// Synchronous peek at memory only. Never touches the keyring.
    pub fn peek(&self) -> SharedSession {
        self.tx.borrow().clone()
    }

    pub async fn replace(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.publish(Some(session.clone()));
        self.persist(&session);
        session
    }

    /// Replaces the session only while `expected` is still the current one.
    ///
    /// Returns `None` when the session was cleared or swapped in the meantime;
    /// `session` is dropped in that case.
    pub async fn replace_if_current(
        &self,
        expected: &Arc<Session>,
        session: Session,
    ) -> Option<Arc<Session>> {
        let session = Arc::new(session);
        let swapped = self.tx.send_if_modified(|current| match current {
            Some(old) if Arc::ptr_eq(old, expected) => {
                *current = Some(session.clone());
                true
            }
            _ => false,
        });
        if !swapped {
            return None;
        }

        self.persist(&session);
        // A clear that raced the keychain write must not leave a copy behind.
        if !self.peek().is_some_and(|now| Arc::ptr_eq(&now, &session)) {
            self.delete_persisted();
            return None;
        }
        Some(session)
    }

    pub async fn clear(&self) {
        self.publish(None);
        self.delete_persisted();
    }

    fn delete_persisted(&self) {
        if let Some(Ok(entry)) = self.entry() {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => tracing::warn!(error = %e, "failed to delete persisted session"),
            }
        }
    }

    fn publish(&self, session: SharedSession) {
        let changed = match (self.tx.borrow().as_ref(), session.as_ref()) {
            (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.tx.send_replace(session);
        }
    }

    fn persist(&self, session: &Session) {
        let Some(entry) = self.entry() else {
            return;
        };
        let result = entry.and_then(|entry| {
            let raw = serde_json::to_string(session)
                .map_err(|e| keyring::Error::PlatformFailure(Box::new(e)))?;
            entry.set_password(&raw)
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist session; keeping it in memory only");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionUser;

    fn session(user: &str, token: &str) -> Session {
        Session {
            access_token: token.to_string(),
            refresh_token: format!("refresh-{token}"),
            expires_at: Some(1_000),
            user: SessionUser {
                id: user.to_string(),
                email: None,
            },
        }
    }

    #[tokio::test]
    async fn in_memory_store_starts_empty() {
        let store = SessionStore::in_memory();
        assert_eq!(store.current().await, Ok(None));
        assert!(!store.is_persistence_available());
    }

    #[tokio::test]
    async fn replace_swaps_whole_session_and_notifies() {
        let store = SessionStore::in_memory();
        let mut rx = store.subscribe();

        let first = store.replace(session("u1", "t1")).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_deref(), Some(&*first));

        let second = store.replace(session("u1", "t2")).await;
        assert_eq!(first.access_token, "t1");
        assert_eq!(
            store.current().await.unwrap().unwrap().access_token,
            second.access_token
        );
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn replace_if_current_only_swaps_the_expected_session() {
        let store = SessionStore::in_memory();
        let first = store.replace(session("u1", "t1")).await;

        let refreshed = store.replace_if_current(&first, session("u1", "t2")).await;
        assert_eq!(refreshed.as_deref().map(|s| s.access_token.as_str()), Some("t2"));

        // `first` is stale now.
        assert_eq!(store.replace_if_current(&first, session("u1", "t3")).await, None);
        assert_eq!(store.peek().unwrap().access_token, "t2");

        store.clear().await;
        let current = refreshed.unwrap();
        assert_eq!(store.replace_if_current(&current, session("u1", "t4")).await, None);
        assert_eq!(store.peek(), None);
    }

    #[tokio::test]
    async fn clear_publishes_none() {
        let store = SessionStore::in_memory();
        store.replace(session("u1", "t1")).await;
        let mut rx = store.subscribe();
        store.clear().await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert_eq!(store.peek(), None);
    }
}
