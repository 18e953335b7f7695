//! Wall-clock helpers shared by the token coordinator and the caches

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in whole seconds since the Unix epoch
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
