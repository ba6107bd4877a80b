//! The active set of monitored endpoints.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{parse_many, Endpoint, LineFailure};
use crate::config::ProbeDefaults;
use crate::events::Totals;

pub type SharedEndpoint = Arc<Mutex<Endpoint>>;

/// Lock an endpoint, recovering the guard if a holder panicked.
pub fn lock(endpoint: &SharedEndpoint) -> MutexGuard<'_, Endpoint> {
    endpoint.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of a bulk import.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub added: Vec<Uuid>,
    /// Normalized addresses that matched an existing endpoint.
    pub duplicates: Vec<String>,
    pub malformed: Vec<LineFailure>,
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub id: Uuid,
    pub endpoint: SharedEndpoint,
    /// Cancelled when the endpoint is removed or the set shuts down.
    pub cancel: CancellationToken,
}

/// Endpoints in insertion order, each behind its own lock.
///
/// Structural changes bump a revision counter that the persistence layer
/// watches to schedule debounced saves.
pub struct EndpointSet {
    entries: RwLock<Vec<Entry>>,
    shutdown: CancellationToken,
    revision: watch::Sender<u64>,
}

impl EndpointSet {
    pub fn new(shutdown: CancellationToken) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: RwLock::new(Vec::new()),
            shutdown,
            revision,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an endpoint unless one with the same protocol and address exists.
    ///
    /// Returns the new id, or `None` for a duplicate.
    pub fn insert(&self, endpoint: Endpoint) -> Option<Uuid> {
        let id = {
            let mut entries = self.write();
            if entries.iter().any(|e| e.id == endpoint.id() || lock(&e.endpoint).same_target(&endpoint)) {
                return None;
            }
            let id = endpoint.id();
            entries.push(Entry {
                id,
                endpoint: Arc::new(Mutex::new(endpoint)),
                cancel: self.shutdown.child_token(),
            });
            id
        };
        self.touch();
        Some(id)
    }

    /// Insert many endpoints, reporting duplicates instead of storing them.
    pub fn import(&self, endpoints: impl IntoIterator<Item = Endpoint>) -> ImportReport {
        let mut report = ImportReport::default();
        for endpoint in endpoints {
            let address = endpoint.address_or_url().to_string();
            match self.insert(endpoint) {
                Some(id) => report.added.push(id),
                None => report.duplicates.push(address),
            }
        }
        report
    }

    /// Parse definition lines and import the ones that parse.
    pub fn import_text(&self, text: &str, defaults: &ProbeDefaults) -> ImportReport {
        let parsed = parse_many(text, defaults);
        let mut report = self.import(parsed.endpoints);
        report.malformed = parsed.failures;
        if !report.malformed.is_empty() {
            tracing::warn!("Import skipped {} malformed line(s)", report.malformed.len());
        }
        report
    }

    /// Remove an endpoint and cancel its in-flight probe.
    pub fn remove(&self, id: Uuid) -> Option<SharedEndpoint> {
        let removed = {
            let mut entries = self.write();
            let index = entries.iter().position(|e| e.id == id)?;
            entries.remove(index)
        };
        removed.cancel.cancel();
        self.touch();
        Some(removed.endpoint)
    }

    pub fn get(&self, id: Uuid) -> Option<SharedEndpoint> {
        self.read().iter().find(|e| e.id == id).map(|e| Arc::clone(&e.endpoint))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.read().iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Current endpoints in insertion order.
    pub fn snapshot(&self) -> Vec<SharedEndpoint> {
        self.read().iter().map(|e| Arc::clone(&e.endpoint)).collect()
    }

    pub(crate) fn entries(&self) -> Vec<Entry> {
        self.read().clone()
    }

    /// Enable or disable one endpoint. Returns false if it does not exist.
    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let Some(endpoint) = self.get(id) else {
            return false;
        };
        lock(&endpoint).set_enabled(enabled);
        self.touch();
        true
    }

    pub fn pause_all(&self) {
        self.set_all_enabled(false);
    }

    pub fn resume_all(&self) {
        self.set_all_enabled(true);
    }

    fn set_all_enabled(&self, enabled: bool) {
        for endpoint in self.snapshot() {
            lock(&endpoint).set_enabled(enabled);
        }
        self.touch();
    }

    /// Count endpoints by the outcome of their latest reply.
    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for endpoint in self.snapshot() {
            match lock(&endpoint).ledger().latest() {
                None => totals.idle += 1,
                Some(reply) if reply.succeeded() => totals.succeeded += 1,
                Some(_) => totals.failed += 1,
            }
        }
        totals
    }

    /// Mark the definitions as changed so a save gets scheduled.
    pub fn touch(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    pub fn subscribe_revisions(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
