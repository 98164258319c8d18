mod app_state;
mod refresh_bus;
mod session_manager;
mod session_store;

pub use app_state::{AppError, AppServices, AppState};
pub use refresh_bus::{RefreshBus, RefreshReason, RefreshRequest, REFRESH_WAIT_LIMIT};
pub use session_manager::{
    is_token_expiring_soon, is_token_expiring_soon_at, SessionManager, DEFAULT_SETTLE_DELAY,
};
pub use session_store::{SessionStore, SessionStoreError, SharedSession, KEYRING_USER_SESSION};
