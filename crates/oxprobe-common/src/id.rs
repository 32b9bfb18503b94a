use snowflake::SnowflakeIdBucket;
use std::sync::{Mutex, OnceLock};

/// Process-wide snowflake bucket. Hosts and probes created at runtime get
/// their identifiers from here.
static BUCKET: OnceLock<Mutex<SnowflakeIdBucket>> = OnceLock::new();

fn bucket() -> &'static Mutex<SnowflakeIdBucket> {
    BUCKET.get_or_init(|| Mutex::new(SnowflakeIdBucket::new(1, 1)))
}

/// Selects the machine/node pair used for subsequent ids. Both values must
/// fit in five bits (0-31).
pub fn init(machine_id: i32, node_id: i32) {
    let mut guard = bucket().lock().unwrap_or_else(|p| p.into_inner());
    *guard = SnowflakeIdBucket::new(machine_id & 0x1f, node_id & 0x1f);
}

/// Returns a fresh identifier in decimal string form.
pub fn next_id() -> String {
    let mut guard = bucket().lock().unwrap_or_else(|p| p.into_inner());
    guard.get_id().to_string()
}
