//! Chakrator event dispatcher.
//!
//! One task drains the event channel and handles events strictly one at a
//! time, in arrival order. Every event re-reads the code store and reloads
//! the reconciler, so an edit applies from the next event on. Nothing the
//! reconciler does (load error, rejection, thrown error, panic) escapes the
//! loop; each outcome becomes one summary log line.

#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chakrator_core::{LogSink, ReconcileError, ResourceEvent, ResourceObject, StatusWriter};
use chakrator_loader::{Loader, Reconciler};
use chakrator_store::CodeStore;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Dispatching,
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Reconciled { status_written: bool },
    LoadFailed(String),
    Rejected(String),
    Faulted(String),
    StatusFailed(String),
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Reconciled { .. } => "reconciled",
            DispatchOutcome::LoadFailed(_) => "load_failed",
            DispatchOutcome::Rejected(_) => "rejected",
            DispatchOutcome::Faulted(_) => "faulted",
            DispatchOutcome::StatusFailed(_) => "status_failed",
        }
    }

    pub fn is_success(&self) -> bool { matches!(self, DispatchOutcome::Reconciled { .. }) }
}

pub struct Dispatcher {
    store: Arc<CodeStore>,
    loader: Arc<dyn Loader>,
    sink: Arc<dyn LogSink>,
    status: Arc<dyn StatusWriter>,
    state_tx: watch::Sender<DispatchState>,
    processed_tx: watch::Sender<u64>,
    processed: u64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<CodeStore>,
        loader: Arc<dyn Loader>,
        sink: Arc<dyn LogSink>,
        status: Arc<dyn StatusWriter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(DispatchState::Idle);
        let (processed_tx, _) = watch::channel(0u64);
        Self { store, loader, sink, status, state_tx, processed_tx, processed: 0 }
    }

    pub fn state(&self) -> DispatchState { *self.state_tx.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<DispatchState> { self.state_tx.subscribe() }
    pub fn subscribe_processed(&self) -> watch::Receiver<u64> { self.processed_tx.subscribe() }
    pub fn processed(&self) -> u64 { self.processed }

    /// Handle one event to completion. `&mut self` keeps calls serialized.
    pub async fn dispatch(&mut self, event: ResourceEvent) -> DispatchOutcome {
        self.state_tx.send_replace(DispatchState::Dispatching);
        let t0 = Instant::now();
        let name = event.object.display_name();
        counter!("dispatch_events_total", 1u64, "kind" => event.kind.as_str());
        self.sink.info(&format!("Event {} for {}", event.kind, event.object.name()));

        let outcome = self.run(&event.object).await;
        let took_ms = t0.elapsed().as_millis();
        self.summarize(&name, &outcome, took_ms);
        histogram!("dispatch_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("dispatch_outcomes_total", 1u64, "outcome" => outcome.as_str());
        info!(kind = %event.kind, object = %name, outcome = outcome.as_str(), took_ms = %took_ms, "dispatch: event done");

        // Idle first: whoever waits on the counter must see the loop ready
        self.state_tx.send_replace(DispatchState::Idle);
        self.processed = self.processed.saturating_add(1);
        self.processed_tx.send_replace(self.processed);
        outcome
    }

    async fn run(&self, object: &ResourceObject) -> DispatchOutcome {
        let source = self.store.read();
        let loaded = std::panic::catch_unwind(AssertUnwindSafe(|| self.loader.load(&source, self.sink.clone())));
        let unit: Arc<dyn Reconciler> = match loaded {
            Ok(Ok(unit)) => unit,
            Ok(Err(e)) => return DispatchOutcome::LoadFailed(e.cause),
            Err(panic) => return DispatchOutcome::LoadFailed(format!("loader panicked: {}", panic_message(&*panic))),
        };

        let res = match AssertUnwindSafe(unit.reconcile(object)).catch_unwind().await {
            Ok(res) => res,
            Err(panic) => Err(ReconcileError::Fault(format!("reconciler panicked: {}", panic_message(&*panic)))),
        };

        match res {
            Ok(out) => match out.status {
                Some(status) => self.write_status(object, &status).await,
                None => DispatchOutcome::Reconciled { status_written: false },
            },
            Err(ReconcileError::Failure(reason)) => DispatchOutcome::Rejected(reason),
            Err(ReconcileError::Fault(fault)) => DispatchOutcome::Faulted(fault),
        }
    }

    async fn write_status(&self, object: &ResourceObject, status: &Value) -> DispatchOutcome {
        match AssertUnwindSafe(self.status.write_status(object, status)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Reconciled { status_written: true },
            Ok(Err(e)) => DispatchOutcome::StatusFailed(format!("{e:#}")),
            Err(panic) => DispatchOutcome::StatusFailed(format!("status writer panicked: {}", panic_message(&*panic))),
        }
    }

    fn summarize(&self, name: &str, outcome: &DispatchOutcome, took_ms: u128) {
        match outcome {
            DispatchOutcome::Reconciled { status_written: true } => {
                self.sink.info(&format!("Reconciled {name} (status updated) in {took_ms}ms"))
            }
            DispatchOutcome::Reconciled { status_written: false } => {
                self.sink.info(&format!("Reconciled {name} in {took_ms}ms"))
            }
            DispatchOutcome::LoadFailed(cause) => {
                self.sink.error(&format!("Failed to load reconciler for {name}: {cause}"))
            }
            DispatchOutcome::Rejected(reason) => self.sink.warn(&format!("Reconcile rejected {name}: {reason}")),
            DispatchOutcome::Faulted(fault) => self.sink.error(&format!("Failed to reconcile {name}: {fault}")),
            DispatchOutcome::StatusFailed(e) => self.sink.error(&format!("Failed to update status for {name}: {e}")),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Reader side of a running dispatcher task.
pub struct DispatcherHandle {
    state_rx: watch::Receiver<DispatchState>,
    processed_rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn state(&self) -> DispatchState { *self.state_rx.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<DispatchState> { self.state_rx.clone() }
    pub fn processed(&self) -> u64 { *self.processed_rx.borrow() }

    /// Wait until at least `n` events have been handled. False if the
    /// dispatcher stopped first.
    pub async fn wait_processed(&mut self, n: u64) -> bool {
        self.processed_rx.wait_for(|v| *v >= n).await.is_ok()
    }

    /// Wait for the loop to finish (all senders dropped and queue drained).
    pub async fn join(self) -> Result<(), tokio::task::JoinError> { self.task.await }
}

/// Spawn the dispatch loop. Returns the event sender (clone it for more
/// producers) and a handle for observing progress.
pub fn spawn_dispatcher(cap: usize, mut dispatcher: Dispatcher) -> (mpsc::Sender<ResourceEvent>, DispatcherHandle) {
    let (tx, mut rx) = mpsc::channel::<ResourceEvent>(cap.max(1));
    let state_rx = dispatcher.subscribe_state();
    let processed_rx = dispatcher.subscribe_processed();

    let task = tokio::spawn(async move {
        debug!("dispatch loop started");
        while let Some(event) = rx.recv().await {
            let _ = dispatcher.dispatch(event).await;
        }
        warn!(processed = dispatcher.processed(), "event channel closed; dispatch loop stopped");
    });

    (tx, DispatcherHandle { state_rx, processed_rx, task })
}

/// Status writer that only reports what it would write. Used for dry runs.
pub struct LoggingStatusWriter {
    sink: Arc<dyn LogSink>,
}

impl LoggingStatusWriter {
    pub fn new(sink: Arc<dyn LogSink>) -> Self { Self { sink } }
}

#[async_trait::async_trait]
impl StatusWriter for LoggingStatusWriter {
    async fn write_status(&self, object: &ResourceObject, status: &Value) -> anyhow::Result<()> {
        let pretty = serde_json::to_string_pretty(status)?;
        self.sink.info(&format!("📊 Status for {} would be updated to: {}", object.display_name(), pretty));
        Ok(())
    }
}
