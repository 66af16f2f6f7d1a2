use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate an id of the form `{prefix}-{millis:x}-{suffix}`.
///
/// The millisecond prefix keeps ids roughly time ordered; the suffix hashes the
/// nanosecond clock, a process-wide counter, the pid and the calling thread so
/// two ids minted in the same millisecond never collide.
pub fn next_id(prefix: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(now.as_nanos().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(format!("{:?}", std::thread::current().id()).as_bytes());
    let digest = hasher.finalize();

    format!("{prefix}-{:x}-{}", now.as_millis(), hex_bytes(&digest[..4]))
}

pub fn step_id() -> String {
    next_id("step")
}

pub fn composition_id() -> String {
    next_id("comp")
}

pub fn performance_id() -> String {
    next_id("perf")
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
