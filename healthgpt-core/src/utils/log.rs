use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
};

use once_cell::sync::Lazy;
use tracing::info;

static HASHED_LOGS: Lazy<Mutex<Vec<u64>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Log `msg` at info level the first time it is seen in this process.
pub fn once_log_info<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    let mut hasher = DefaultHasher::new();
    msg.hash(&mut hasher);
    let hash = hasher.finish();

    let mut log = HASHED_LOGS.lock().unwrap_or_else(|e| e.into_inner());
    if !log.contains(&hash) {
        info!("{msg}");
        log.push(hash);
    }
}
