//! Small helpers shared by the capture and apply engines: timestamp
//! conversion between the Unix and Windows epochs, UTF-16 conversion, and
//! path splitting.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Seconds between the Windows epoch (1601-01-01) and the Unix epoch.
const WINDOWS_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// 100-nanosecond ticks per second.
const TICKS_PER_SEC: i64 = 10_000_000;

/// Converts a Unix timestamp to 100-ns ticks since the Windows epoch.
///
/// Times before 1601 clamp to zero.
pub fn unix_to_wim_timestamp(secs: i64, nsecs: i64) -> u64 {
    let ticks = (secs + WINDOWS_EPOCH_OFFSET_SECS) * TICKS_PER_SEC + nsecs / 100;
    ticks.max(0) as u64
}

/// Converts 100-ns ticks since the Windows epoch back to Unix
/// `(seconds, nanoseconds)`.
pub fn wim_timestamp_to_unix(ticks: u64) -> (i64, i64) {
    let ticks = ticks as i64;
    let secs = ticks.div_euclid(TICKS_PER_SEC) - WINDOWS_EPOCH_OFFSET_SECS;
    let nsecs = ticks.rem_euclid(TICKS_PER_SEC) * 100;
    (secs, nsecs)
}

/// The current wall-clock time in 100-ns ticks since the Windows epoch.
pub fn now_wim_timestamp() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => unix_to_wim_timestamp(d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(_) => 0,
    }
}

/// Returns the final component of a `/`-separated path.
///
/// `""` and `"/"` both yield the empty string, matching the name of an
/// image root.
pub fn path_basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Converts a UTF-16 name (as stored for short names) to UTF-8.
pub fn utf16_to_utf8(units: &[u16]) -> Result<String> {
    String::from_utf16(units).map_err(|_| Error::InvalidUtf8String)
}

/// Converts a UTF-8 string to UTF-16 code units.
pub fn utf8_to_utf16(s: &str) -> Box<[u16]> {
    s.encode_utf16().collect()
}
