//! Time helpers.

use std::time::SystemTime;

/// Gets the current Unix timestamp, in seconds.
pub fn get_unix_timestamp() -> i64 {
    let since_unix_epoch = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    since_unix_epoch.as_secs() as i64
}
