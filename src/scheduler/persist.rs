//! Persistence manager: debounced definition saves and periodic history flushes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::db::{EndpointRecord, PersistenceBridge, ReplyHistory};
use crate::endpoint::{lock, EndpointSet};

/// Counts from a startup restore.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub endpoints: usize,
    pub replies: usize,
    pub skipped: usize,
}

/// Owns the save timers. At most one write is in flight at a time.
pub struct PersistenceManager {
    bridge: Arc<dyn PersistenceBridge>,
    endpoints: Arc<EndpointSet>,
    resilient_history: bool,
    max_replies: usize,
    save_debounce: Duration,
    history_interval: Duration,
    flush_lock: Mutex<()>,
    /// Set when an endpoint save failed and must be retried.
    endpoints_dirty: AtomicBool,
    /// Set when stored definitions could not be loaded; cleared by the first real change.
    definitions_held: AtomicBool,
}

impl PersistenceManager {
    pub fn new(bridge: Arc<dyn PersistenceBridge>, endpoints: Arc<EndpointSet>, config: &MonitorConfig) -> Self {
        Self {
            bridge,
            endpoints,
            resilient_history: config.resilient_history,
            max_replies: config.max_replies,
            save_debounce: config.save_debounce,
            history_interval: config.history_save_interval,
            flush_lock: Mutex::new(()),
            endpoints_dirty: AtomicBool::new(false),
            definitions_held: AtomicBool::new(false),
        }
    }

    /// Load definitions, and history when resilient history is on, into the set.
    ///
    /// Definitions and history load separately, so unreadable history only
    /// costs the history. When the definitions cannot be read, the stored
    /// copy is left untouched until the set actually changes.
    pub async fn restore(&self) -> RestoreSummary {
        let bridge = Arc::clone(&self.bridge);
        let records = match tokio::task::spawn_blocking(move || bridge.load_endpoints()).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                tracing::error!("PersistenceManager: Failed to load endpoints: {}", e);
                self.definitions_held.store(true, Ordering::Relaxed);
                return RestoreSummary::default();
            }
            Err(e) => {
                tracing::error!("PersistenceManager: Load task failed: {}", e);
                self.definitions_held.store(true, Ordering::Relaxed);
                return RestoreSummary::default();
            }
        };

        let mut history = if self.resilient_history { self.load_history().await } else { ReplyHistory::new() };

        let mut summary = RestoreSummary::default();
        for record in records {
            let id = record.id;
            let endpoint = match record.into_endpoint() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!("PersistenceManager: Skipping stored endpoint {}: {}", id, e);
                    summary.skipped += 1;
                    continue;
                }
            };
            if self.endpoints.insert(endpoint).is_none() {
                summary.skipped += 1;
                continue;
            }
            summary.endpoints += 1;

            if let (Some(replies), Some(shared)) = (history.remove(&id), self.endpoints.get(id)) {
                summary.replies += replies.len();
                lock(&shared).ledger_mut().restore(replies);
            }
        }

        tracing::info!(
            "Restored {} endpoints and {} replies ({} skipped)",
            summary.endpoints,
            summary.replies,
            summary.skipped
        );
        summary
    }

    async fn load_history(&self) -> ReplyHistory {
        let bridge = Arc::clone(&self.bridge);
        match tokio::task::spawn_blocking(move || bridge.load_reply_history()).await {
            Ok(Ok(history)) => history,
            Ok(Err(e)) => {
                tracing::warn!("PersistenceManager: Failed to load reply history, starting with empty ledgers: {}", e);
                ReplyHistory::new()
            }
            Err(e) => {
                tracing::warn!("PersistenceManager: History load task failed: {}", e);
                ReplyHistory::new()
            }
        }
    }

    /// Start the debounce and history timers. Both stop on `shutdown`.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        // Subscribed here so changes made right after `start` are seen
        let revisions = self.endpoints.subscribe_revisions();
        vec![
            tokio::spawn(Arc::clone(self).run_debounced_saves(revisions, shutdown.clone())),
            tokio::spawn(Arc::clone(self).run_history_flushes(shutdown)),
        ]
    }

    async fn run_debounced_saves(self: Arc<Self>, mut revisions: watch::Receiver<u64>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            // Wait for a quiet period before writing
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.save_debounce) => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            self.definitions_held.store(false, Ordering::Relaxed);
            self.save_endpoints().await;
        }
    }

    async fn run_history_flushes(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.history_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if self.endpoints_dirty.load(Ordering::Relaxed) {
                        self.save_endpoints().await;
                    }
                    self.flush_history().await;
                }
            }
        }
    }

    /// Write every endpoint definition. Returns whether the save succeeded.
    ///
    /// Skipped while a failed load holds the stored definitions.
    pub async fn save_endpoints(&self) -> bool {
        if self.definitions_held.load(Ordering::Relaxed) {
            tracing::debug!("Stored endpoints were not loaded, leaving them untouched");
            return false;
        }
        let _guard = self.flush_lock.lock().await;
        let records: Vec<EndpointRecord> = self
            .endpoints
            .snapshot()
            .iter()
            .map(|endpoint| EndpointRecord::from(&*lock(endpoint)))
            .collect();

        let bridge = Arc::clone(&self.bridge);
        let count = records.len();
        match tokio::task::spawn_blocking(move || bridge.save_endpoints(&records)).await {
            Ok(Ok(())) => {
                self.endpoints_dirty.store(false, Ordering::Relaxed);
                tracing::debug!("Saved {} endpoint definitions", count);
                true
            }
            Ok(Err(e)) => {
                self.endpoints_dirty.store(true, Ordering::Relaxed);
                tracing::error!("PersistenceManager: Failed to save endpoints: {}", e);
                false
            }
            Err(e) => {
                self.endpoints_dirty.store(true, Ordering::Relaxed);
                tracing::error!("PersistenceManager: Save task failed: {}", e);
                false
            }
        }
    }

    /// Apply the retention cap, then write the reply history if enabled.
    ///
    /// Returns whether anything was written.
    pub async fn flush_history(&self) -> bool {
        let _guard = self.flush_lock.lock().await;
        let endpoints = self.endpoints.snapshot();

        if self.max_replies > 0 {
            let evicted: usize = endpoints
                .iter()
                .map(|endpoint| lock(endpoint).ledger_mut().evict_to(self.max_replies))
                .sum();
            if evicted > 0 {
                tracing::debug!("Evicted {} replies beyond the retention cap", evicted);
            }
        }

        if !self.resilient_history || endpoints.is_empty() {
            return false;
        }

        let history: ReplyHistory = endpoints
            .iter()
            .map(|endpoint| {
                let endpoint = lock(endpoint);
                (endpoint.id(), endpoint.ledger().iter().cloned().collect())
            })
            .collect();

        let bridge = Arc::clone(&self.bridge);
        match tokio::task::spawn_blocking(move || bridge.save_reply_history(&history)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("PersistenceManager: Failed to save reply history: {}", e);
                false
            }
            Err(e) => {
                tracing::error!("PersistenceManager: History save task failed: {}", e);
                false
            }
        }
    }

    /// Final save on shutdown.
    pub async fn flush_all(&self) {
        self.save_endpoints().await;
        self.flush_history().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeDefaults;
    use crate::db::{DbError, Store};
    use crate::endpoint::parse_line;
    use crate::probe::Reply;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use tempfile::NamedTempFile;

    fn config(resilient: bool, max_replies: usize) -> MonitorConfig {
        MonitorConfig {
            resilient_history: resilient,
            max_replies,
            save_debounce: Duration::from_millis(50),
            ..MonitorConfig::default()
        }
    }

    fn add(endpoints: &EndpointSet, line: &str, failures: usize) -> uuid::Uuid {
        let id = endpoints.insert(parse_line(line, &ProbeDefaults::default()).unwrap()).unwrap();
        let shared = endpoints.get(id).unwrap();
        let mut endpoint = lock(&shared);
        for _ in 0..failures {
            endpoint.ledger_mut().append(Reply::cancelled(None, Utc::now()));
        }
        id
    }

    /// Bridge that counts calls and fails on demand.
    #[derive(Default)]
    struct CountingBridge {
        endpoint_saves: AtomicUsize,
        history_saves: AtomicUsize,
        fail: AtomicBool,
    }

    impl PersistenceBridge for CountingBridge {
        fn load_endpoints(&self) -> Result<Vec<EndpointRecord>, DbError> {
            Err(DbError::Corrupt("unreadable endpoints table".into()))
        }

        fn save_endpoints(&self, _: &[EndpointRecord]) -> Result<(), DbError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DbError::Migration("disk full".into()));
            }
            self.endpoint_saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn load_reply_history(&self) -> Result<ReplyHistory, DbError> {
            Ok(ReplyHistory::new())
        }

        fn save_reply_history(&self, _: &ReplyHistory) -> Result<(), DbError> {
            self.history_saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let tmp = NamedTempFile::new().unwrap();
        let store: Arc<dyn PersistenceBridge> = Arc::new(Store::new(tmp.path()).unwrap());

        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        let id = add(&endpoints, "tcp://127.0.0.1:80,web", 3);
        let manager = PersistenceManager::new(Arc::clone(&store), Arc::clone(&endpoints), &config(true, 0));
        assert!(manager.save_endpoints().await);
        assert!(manager.flush_history().await);

        let restored = Arc::new(EndpointSet::new(CancellationToken::new()));
        let manager = PersistenceManager::new(store, Arc::clone(&restored), &config(true, 0));
        let summary = manager.restore().await;
        assert_eq!(summary, RestoreSummary { endpoints: 1, replies: 3, skipped: 0 });

        let shared = restored.get(id).unwrap();
        let endpoint = lock(&shared);
        assert_eq!(endpoint.description, "web");
        assert_eq!(endpoint.ledger().stats().failed_count, 3);
        assert_eq!(endpoint.ledger().stats().consecutive_failed_count, 3);
    }

    #[tokio::test]
    async fn test_history_skipped_when_not_resilient() {
        let bridge = Arc::new(CountingBridge::default());
        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        add(&endpoints, "1.1.1.1", 1);
        let manager = PersistenceManager::new(bridge.clone(), Arc::clone(&endpoints), &config(false, 0));
        assert!(!manager.flush_history().await);
        assert_eq!(bridge.history_saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_history_skipped_when_empty() {
        let bridge = Arc::new(CountingBridge::default());
        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        let manager = PersistenceManager::new(bridge.clone(), endpoints, &config(true, 0));
        assert!(!manager.flush_history().await);
        assert_eq!(bridge.history_saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flush_applies_retention_cap() {
        let bridge = Arc::new(CountingBridge::default());
        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        let id = add(&endpoints, "1.1.1.1", 10);
        let manager = PersistenceManager::new(bridge.clone(), Arc::clone(&endpoints), &config(false, 4));
        manager.flush_history().await;

        let shared = endpoints.get(id).unwrap();
        let endpoint = lock(&shared);
        assert_eq!(endpoint.ledger().len(), 4);
        assert_eq!(endpoint.ledger().stats().sent_count, 4);
    }

    #[tokio::test]
    async fn test_failed_load_starts_empty() {
        let bridge = Arc::new(CountingBridge::default());
        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        let manager = PersistenceManager::new(bridge, Arc::clone(&endpoints), &config(true, 0));
        assert_eq!(manager.restore().await, RestoreSummary::default());
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_history_keeps_definitions() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let bridge: Arc<dyn PersistenceBridge> = store.clone();

        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        add(&endpoints, "tcp://127.0.0.1:80,web", 2);
        let manager = PersistenceManager::new(Arc::clone(&bridge), endpoints, &config(true, 0));
        manager.flush_all().await;

        let conn = rusqlite::Connection::open(tmp.path()).unwrap();
        conn.execute("UPDATE replies SET status = 'garbage'", []).unwrap();
        drop(conn);

        let restored = Arc::new(EndpointSet::new(CancellationToken::new()));
        let manager = PersistenceManager::new(bridge, Arc::clone(&restored), &config(true, 0));
        let summary = manager.restore().await;
        assert_eq!(summary, RestoreSummary { endpoints: 1, replies: 0, skipped: 0 });

        manager.flush_all().await;
        assert_eq!(store.load_endpoints().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_holds_stored_definitions() {
        let bridge = Arc::new(CountingBridge::default());
        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        let manager = Arc::new(PersistenceManager::new(bridge.clone(), Arc::clone(&endpoints), &config(false, 0)));
        manager.restore().await;

        manager.flush_all().await;
        assert!(!manager.save_endpoints().await);
        assert_eq!(bridge.endpoint_saves.load(Ordering::SeqCst), 0);

        // An actual edit replaces what could not be read
        let shutdown = CancellationToken::new();
        let handles = manager.start(shutdown.clone());
        add(&endpoints, "1.1.1.1", 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bridge.endpoint_saves.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_save_marks_dirty() {
        let bridge = Arc::new(CountingBridge::default());
        bridge.fail.store(true, Ordering::SeqCst);
        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        let manager = PersistenceManager::new(bridge.clone(), endpoints, &config(false, 0));
        assert!(!manager.save_endpoints().await);
        assert!(manager.endpoints_dirty.load(Ordering::Relaxed));

        bridge.fail.store(false, Ordering::SeqCst);
        assert!(manager.save_endpoints().await);
        assert!(!manager.endpoints_dirty.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_debounced_save_coalesces_changes() {
        let bridge = Arc::new(CountingBridge::default());
        let endpoints = Arc::new(EndpointSet::new(CancellationToken::new()));
        let manager = Arc::new(PersistenceManager::new(bridge.clone(), Arc::clone(&endpoints), &config(false, 0)));
        let shutdown = CancellationToken::new();
        let handles = manager.start(shutdown.clone());

        add(&endpoints, "1.1.1.1", 0);
        add(&endpoints, "1.0.0.1", 0);
        add(&endpoints, "9.9.9.9", 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bridge.endpoint_saves.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
