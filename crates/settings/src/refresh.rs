//! Background refresh cycles.
//!
//! One cycle runs per settings source. Each iteration polls the source's
//! reader, parses and validates the document, and applies it through the
//! versioned store — skipping the write when the version is unchanged.
//! Reads against the store only ever observe completed refreshes;
//! `RefreshHandle::await_first_refresh` gates Start()-dependent lookups.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use beacon_core::{
    BeaconError, FaultSeverity, SettingsReader, SettingsStore, TelemetrySink,
};

use crate::document::parse_document;
use crate::store::VersionedSettingsStore;

/// Result of one refresh iteration.
#[derive(Debug, PartialEq)]
pub enum RefreshOutcome {
    /// The source was unavailable or stale; nothing changed.
    Unavailable,
    /// The fetched version is already applied.
    UpToDate,
    /// A new version was applied.
    Applied { version: String },
}

/// A fetch-parse-apply cycle for a single settings source.
pub struct RefreshCycle<S> {
    reader: Arc<dyn SettingsReader>,
    store: Arc<VersionedSettingsStore<S>>,
    telemetry: Arc<dyn TelemetrySink>,
    /// Source name recorded as each setting's origin.
    origin: String,
    /// Optional scope conjoined onto every leaf of this source.
    global_scope: Option<String>,
}

impl<S: SettingsStore + 'static> RefreshCycle<S> {
    pub fn new(
        reader: Arc<dyn SettingsReader>,
        store: Arc<VersionedSettingsStore<S>>,
        telemetry: Arc<dyn TelemetrySink>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            store,
            telemetry,
            origin: origin.into(),
            global_scope: None,
        }
    }

    pub fn with_global_scope(mut self, scope: impl Into<String>) -> Self {
        self.global_scope = Some(scope.into());
        self
    }

    /// Run a single fetch-parse-apply iteration.
    ///
    /// A malformed document is rejected whole: the previously applied
    /// version stays in place and a fault is reported.
    pub async fn run_once(&self) -> Result<RefreshOutcome, BeaconError> {
        let Some(text) = self.reader.read_current().await else {
            return Ok(RefreshOutcome::Unavailable);
        };

        let document =
            match parse_document(&text, &self.origin, self.global_scope.as_deref()) {
                Ok(document) => document,
                Err(e) => {
                    warn!(origin = %self.origin, error = %e, "settings document rejected");
                    self.telemetry.post_fault(
                        FaultSeverity::General,
                        "settings/document-rejected",
                        &format!("source '{}': {}", self.origin, e),
                    );
                    return Err(BeaconError::Parse(e.to_string()));
                }
            };

        let version = document.version.clone();
        if self.store.apply(&document).await? {
            info!(origin = %self.origin, %version, "settings refreshed");
            Ok(RefreshOutcome::Applied { version })
        } else {
            Ok(RefreshOutcome::UpToDate)
        }
    }

    /// Spawn the polling loop as a background task.
    pub fn spawn(self) -> RefreshHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let interval = self.reader.polling_interval();
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = self.run_once().await {
                    warn!(origin = %self.origin, error = %e, "refresh iteration failed");
                }
                // First completion unblocks Start()-gated readers even when
                // the source was unavailable; they see the prior version.
                let _ = done_tx.send(true);

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        RefreshHandle {
            cancel: cancel_tx,
            first_done: done_rx,
            task,
        }
    }
}

/// Handle to a spawned refresh loop.
pub struct RefreshHandle {
    cancel: watch::Sender<bool>,
    first_done: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Wait until at least one refresh iteration has completed.
    pub async fn await_first_refresh(&self) {
        let mut done = self.first_done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    /// Stop the polling loop. In-flight iterations finish; no further ones
    /// are scheduled.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Cancel and wait for the loop task to exit.
    pub async fn shutdown(self) {
        self.cancel();
        let _ = self.task.await;
    }
}
