use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Default maximum number of activity entries to keep in memory
pub const DEFAULT_MAX_ACTIVITY_ENTRIES: usize = 500;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. Calling this
/// more than once is harmless.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub owner_id: Option<String>,
}

/// Recent reconciliation activity, shown as status text in the settings view.
pub struct ActivityLog {
    entries: Arc<Mutex<VecDeque<ActivityEntry>>>,
    max_entries: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ACTIVITY_ENTRIES)
    }
}

impl ActivityLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ActivityEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, level: &str, message: &str, owner_id: Option<&str>) {
        let now = chrono::Utc::now().to_rfc3339();
        let entry = ActivityEntry {
            id: now.clone(),
            timestamp: now,
            level: level.to_string(),
            message: message.to_string(),
            owner_id: owner_id.map(str::to_string),
        };

        let mut entries = self.lock();
        entries.push_back(entry);

        // Remove from front if full
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub fn entries(&self, owner_id: Option<&str>) -> Vec<ActivityEntry> {
        let entries = self.lock();
        match owner_id {
            Some(id) => entries.iter().filter(|e| e.owner_id.as_deref() == Some(id)).cloned().collect(),
            None => entries.iter().cloned().collect(),
        }
    }

    /// Get entries with pagination
    pub fn entries_paginated(&self, owner_id: Option<&str>, offset: usize, limit: usize) -> Vec<ActivityEntry> {
        let filtered = self.entries(owner_id);
        filtered.into_iter().skip(offset).take(limit).collect()
    }

    pub fn latest(&self) -> Option<ActivityEntry> {
        self.lock().back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_log_new() {
        let log = ActivityLog::new(100);
        assert!(log.entries(None).is_empty());
        assert!(log.latest().is_none());
    }

    #[test]
    fn test_activity_log_rotation() {
        let log = ActivityLog::new(3);

        for i in 0..5 {
            log.record("info", &format!("message {}", i), None);
        }

        let entries = log.entries(None);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "message 2");
        assert_eq!(log.latest().unwrap().message, "message 4");
    }

    #[test]
    fn test_activity_log_filter_by_owner() {
        let log = ActivityLog::new(10);

        log.record("info", "run finished", None);
        log.record("warn", "rename failed", Some("o1"));
        log.record("warn", "add failed", Some("o1"));

        assert_eq!(log.entries(None).len(), 3);
        assert_eq!(log.entries(Some("o1")).len(), 2);
        assert!(log.entries(Some("nonexistent")).is_empty());
    }

    #[test]
    fn test_activity_log_pagination() {
        let log = ActivityLog::new(100);

        for i in 0..20 {
            log.record("info", &format!("message {}", i), None);
        }

        assert_eq!(log.entries_paginated(None, 0, 10).len(), 10);
        assert_eq!(log.entries_paginated(None, 10, 10).len(), 10);
        assert_eq!(log.entries_paginated(None, 20, 10).len(), 0);
    }

    #[test]
    fn test_activity_log_thread_safety() {
        let log = Arc::new(ActivityLog::new(100));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || log.record("info", &format!("Thread {}", i), None))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(log.entries(None).len(), 10);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing("debug");
        init_tracing("info");
    }
}
