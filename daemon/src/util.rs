use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Cryptographically random bytes, hex encoded.
pub fn random_hex(len: usize) -> String {
    use rand_core::{OsRng, RngCore};
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time string comparison for secret tokens. Length differences
/// still leak, which is acceptable for fixed-length hex tokens.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Compact timestamp for file names: `YYYYMMDD-HHMMSS`.
pub fn filename_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Date component for the per-day diagnostics directory: `YYYY-MM-DD`.
pub fn log_date() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}
