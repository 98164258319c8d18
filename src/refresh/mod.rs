mod policy;
mod refresh_loop;

pub use policy::{compute_next_refresh_delay_ms, compute_retry_delay_ms};
pub use refresh_loop::spawn_refresh_loop;
