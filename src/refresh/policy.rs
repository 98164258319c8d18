use crate::types::Session;

const JITTER_RATIO: f64 = 0.1;
const RETRY_BASE_MS: u64 = 1_000;
const RETRY_MAX_MS: u64 = 60_000;

fn compute_next_refresh_delay_ms_with_nanos(
    session: Option<&Session>,
    threshold_seconds: i64,
    now: i64,
    nanos: i128,
) -> Option<u64> {
    let session = session?;
    let Some(expires_at) = session.expires_at else {
        return Some(0);
    };

    let lead_seconds = expires_at
        .saturating_sub(threshold_seconds)
        .saturating_sub(now);
    if lead_seconds <= 0 {
        return Some(0);
    }

    // Jitter only ever moves the refresh earlier.
    let base_ms = (lead_seconds as u64).saturating_mul(1000);
    let frac = (nanos.rem_euclid(1000) as f64) / 1000.0;
    let early = (frac * base_ms as f64 * JITTER_RATIO) as u64;
    Some(base_ms - early.min(base_ms))
}

/// Milliseconds until the session should be refreshed, or `None` when there is
/// no session to keep alive.
pub fn compute_next_refresh_delay_ms(
    session: Option<&Session>,
    threshold_seconds: i64,
) -> Option<u64> {
    let now = time::OffsetDateTime::now_utc();
    compute_next_refresh_delay_ms_with_nanos(
        session,
        threshold_seconds,
        now.unix_timestamp(),
        now.unix_timestamp_nanos(),
    )
}

pub fn compute_retry_delay_ms(consecutive_failures: u32) -> u64 {
    if consecutive_failures == 0 {
        return 0;
    }
    let exponent = (consecutive_failures - 1).min(16);
    RETRY_BASE_MS
        .saturating_mul(1_u64 << exponent)
        .min(RETRY_MAX_MS)
}
