//! Scheduler module for running probes and persisting their results.
//!
//! A single interval drives ticks. Each tick claims every due endpoint by
//! setting its busy flag and spawns one probe task per endpoint. Each task
//! appends its reply to the endpoint's ledger and clears the flag.

mod persist;

pub use persist::*;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::endpoint::{lock, EndpointSet, SharedEndpoint};
use crate::events::{MonitorEvent, Totals};
use crate::probe::{resolve_host, ProbeTarget, Prober, Reply, ReplyStatus};

const EVENT_CAPACITY: usize = 1024;

/// A probe claimed during a tick.
struct Dispatch {
    id: Uuid,
    endpoint: SharedEndpoint,
    target: ProbeTarget,
    timeout: Duration,
    cancel: CancellationToken,
}

/// What a tick's probes did, once they have all finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub appended: usize,
    pub status_changed: bool,
}

/// How one dispatched probe ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Appended { status_changed: bool },
    Discarded,
}

/// Probes spawned by one tick. Dropping it leaves them running.
pub struct TickHandle {
    tasks: Vec<JoinHandle<Completion>>,
}

impl TickHandle {
    pub fn dispatched(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every probe of this tick to finish.
    pub async fn join(self) -> TickSummary {
        let mut summary = TickSummary { dispatched: self.tasks.len(), ..Default::default() };
        for task in self.tasks {
            match task.await {
                Ok(Completion::Appended { status_changed }) => {
                    summary.appended += 1;
                    summary.status_changed |= status_changed;
                }
                Ok(Completion::Discarded) => {}
                Err(e) => tracing::error!("Probe task failed to join: {}", e),
            }
        }
        summary
    }
}

/// Clears the busy flag if a probe task ends without completing.
struct BusyRelease {
    endpoint: SharedEndpoint,
    armed: bool,
}

impl BusyRelease {
    fn new(endpoint: SharedEndpoint) -> Self {
        Self { endpoint, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BusyRelease {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.endpoint).set_busy(false);
        }
    }
}

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    endpoints: Arc<EndpointSet>,
    prober: Prober,
    tick_interval: Duration,
    /// Bounds in-flight probes across ticks. `None` lets the runtime decide.
    limiter: Option<Arc<Semaphore>>,
    events: broadcast::Sender<MonitorEvent>,
    totals: watch::Sender<Totals>,
}

impl Scheduler {
    pub fn new(endpoints: Arc<EndpointSet>, prober: Prober, config: &MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (totals, _) = watch::channel(endpoints.totals());
        Self {
            endpoints,
            prober,
            tick_interval: config.tick_interval,
            limiter: config
                .max_parallelism
                .filter(|n| *n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
            events,
            totals,
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointSet> {
        &self.endpoints
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn totals(&self) -> watch::Receiver<Totals> {
        self.totals.subscribe()
    }

    /// Publish an event; having no subscribers is fine.
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    /// Start the tick loop. It stops when `shutdown` is cancelled.
    ///
    /// Ticks never wait for probes, so a slow endpoint cannot delay the others.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                "Starting scheduler with {} endpoints (tick {:?})",
                scheduler.endpoints.len(),
                scheduler.tick_interval
            );
            let mut interval = tokio::time::interval(scheduler.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.tick();
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        })
    }

    /// Claim every due endpoint and spawn its probe.
    ///
    /// Returns immediately; the busy flag keeps a still-running probe from
    /// being dispatched again by later ticks.
    pub fn tick(self: &Arc<Self>) -> TickHandle {
        let tasks = self
            .claim_due()
            .into_iter()
            .map(|dispatch| self.spawn_probe(dispatch))
            .collect();
        TickHandle { tasks }
    }

    /// Collect due endpoints and mark them busy while holding their locks.
    fn claim_due(&self) -> Vec<Dispatch> {
        let now = Utc::now();
        let mut due = Vec::new();
        for entry in self.endpoints.entries() {
            if entry.cancel.is_cancelled() {
                continue;
            }
            let mut endpoint = lock(&entry.endpoint);
            if !endpoint.is_due(now) {
                continue;
            }
            endpoint.set_busy(true);
            due.push(Dispatch {
                id: entry.id,
                target: ProbeTarget::from(&*endpoint),
                timeout: Duration::from_secs_f64(endpoint.timeout_seconds()),
                endpoint: Arc::clone(&entry.endpoint),
                cancel: entry.cancel.clone(),
            });
        }
        due
    }

    fn spawn_probe(self: &Arc<Self>, dispatch: Dispatch) -> JoinHandle<Completion> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let release = BusyRelease::new(Arc::clone(&dispatch.endpoint));
            let _permit = match &scheduler.limiter {
                Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                None => None,
            };
            let outcome = run_guarded(&scheduler.prober, &dispatch).await;
            let completion = scheduler.complete(dispatch, outcome);
            release.disarm();
            completion
        })
    }

    fn complete(&self, dispatch: Dispatch, outcome: Result<Reply, String>) -> Completion {
        let reply = match outcome {
            Ok(reply) => reply,
            Err(panic) => {
                tracing::error!(
                    endpoint = %dispatch.id,
                    "Prober panicked for {}; this should never happen: {}",
                    dispatch.target.address_or_url,
                    panic
                );
                lock(&dispatch.endpoint).set_busy(false);
                return Completion::Discarded;
            }
        };

        if !self.endpoints.contains(dispatch.id)
            || (dispatch.cancel.is_cancelled() && reply.status() == ReplyStatus::Cancelled)
        {
            tracing::debug!("Discarding reply for removed or cancelled endpoint {}", dispatch.id);
            lock(&dispatch.endpoint).set_busy(false);
            return Completion::Discarded;
        }

        let (changed, status, dns_host) = {
            let mut endpoint = lock(&dispatch.endpoint);
            let changed = endpoint.complete_probe(reply.clone(), Utc::now());
            (changed, endpoint.ledger().last_status(), endpoint.take_dns_attempt())
        };

        self.emit(MonitorEvent::ReplyAppended { endpoint_id: dispatch.id, reply });
        if changed {
            self.emit(MonitorEvent::EndpointStatusChanged { endpoint_id: dispatch.id, status });
            self.refresh_totals();
        }

        if let Some(host) = dns_host {
            spawn_dns_enrichment(dispatch.endpoint, host, dispatch.timeout);
        }
        Completion::Appended { status_changed: changed }
    }

    /// Recount totals and publish them if they moved.
    pub fn refresh_totals(&self) -> Totals {
        let totals = self.endpoints.totals();
        let modified = self.totals.send_if_modified(|current| {
            if *current == totals {
                false
            } else {
                *current = totals;
                true
            }
        });
        if modified {
            self.emit(MonitorEvent::TotalsChanged(totals));
        }
        totals
    }
}

/// Probe with a panic guard so one broken probe cannot take down a tick.
async fn run_guarded(prober: &Prober, dispatch: &Dispatch) -> Result<Reply, String> {
    AssertUnwindSafe(prober.probe(&dispatch.target, dispatch.timeout, &dispatch.cancel))
        .catch_unwind()
        .await
        .map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolve the endpoint's host in the background. Failures are retried on a
/// later successful probe, up to the attempt cap.
fn spawn_dns_enrichment(endpoint: SharedEndpoint, host: String, timeout: Duration) {
    tokio::spawn(async move {
        match resolve_host(&host, timeout).await {
            Ok(entry) => lock(&endpoint).apply_dns(entry),
            Err(e) => tracing::debug!("DNS enrichment for {} failed: {}", host, e),
        }
    });
}
