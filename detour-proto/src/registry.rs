/// Generic session table + liveness tracking, shared by the client and
/// server session managers. Each entry owns its forwarder tasks and an
/// opaque payload the caller uses for additional teardown (closing sockets).
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

struct Entry<T> {
    payload: T,
    uplink: JoinHandle<()>,
    downlink: JoinHandle<()>,
    last_activity: AtomicI64,
}

/// `T` is whatever per-session resource the owner needs to finish tearing
/// down once the forwarder tasks are cancelled (e.g. the data socket).
pub struct SessionRegistry<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: String, payload: T, uplink: JoinHandle<()>, downlink: JoinHandle<()>) {
        let entry = Entry {
            payload,
            uplink,
            downlink,
            last_activity: AtomicI64::new(now()),
        };
        self.entries.lock().unwrap().insert(key, entry);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn touch(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get(key) {
            entry.last_activity.store(now(), Ordering::Relaxed);
        }
    }

    /// Remove and return the session's payload, cancelling its forwarders.
    /// Returns `None` if the session was already closed — callers should
    /// treat that as routine, not an error.
    pub fn close(&self, key: &str) -> Option<T> {
        let entry = self.entries.lock().unwrap().remove(key)?;
        entry.uplink.abort();
        entry.downlink.abort();
        Some(entry.payload)
    }

    /// Keys whose last activity is older than `idle_secs`.
    pub fn idle_keys(&self, idle_secs: i64) -> Vec<String> {
        let cutoff = now() - idle_secs;
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.last_activity.load(Ordering::Relaxed) < cutoff)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_touch_and_close() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let uplink = tokio::spawn(std::future::pending::<()>());
        let downlink = tokio::spawn(std::future::pending::<()>());
        registry.insert("conn-1".into(), 7, uplink, downlink);

        assert!(registry.contains("conn-1"));
        registry.touch("conn-1");

        let payload = registry.close("conn-1").unwrap();
        assert_eq!(payload, 7);
        assert!(!registry.contains("conn-1"));
        assert!(registry.close("conn-1").is_none());
    }

    #[tokio::test]
    async fn idle_keys_reports_stale_sessions() {
        let registry: SessionRegistry<()> = SessionRegistry::new();
        let uplink = tokio::spawn(std::future::pending::<()>());
        let downlink = tokio::spawn(std::future::pending::<()>());
        registry.insert("stale".into(), (), uplink, downlink);

        // Freshly inserted sessions aren't idle relative to a zero-second window
        // unless we look strictly in the past; use a negative idle_secs to force it.
        let idle = registry.idle_keys(-1);
        assert_eq!(idle, vec!["stale".to_string()]);
    }
}
