//! Utilities for testing machines, available in unit tests and behind
//! the `testing` feature for downstream crates.
//!
//! The centerpiece is [`TraceRecorder`]: attach one to a machine builder
//! and every entry, exit, and transition lands in an in-memory log that
//! tests can assert on or await. That turns "wait and poll `is_in_state`"
//! into "wait for the trace to say so", which is both faster and
//! race-free.
//!
//! # Example
//!
//! ```ignore
//! let recorder = TraceRecorder::new();
//! let machine = recorder
//!     .attach(Machine::builder(chart, Context::default()))
//!     .build();
//! machine.start();
//! machine.post(command)?;
//!
//! recorder
//!     .wait_until(
//!         |records| records.contains(&TraceRecord::entered("WaitForResponse")),
//!         Duration::from_secs(1),
//!     )
//!     .await?;
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::machine::MachineBuilder;

/// One observed machine moment, without the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceRecord {
    Entered {
        state: String,
    },
    Exited {
        state: String,
    },
    Fired {
        source: String,
        target: String,
        /// `None` for completion transitions.
        event: Option<String>,
    },
}

impl TraceRecord {
    /// Shorthand for an `Entered` record, handy in assertions.
    pub fn entered(state: &str) -> Self {
        TraceRecord::Entered {
            state: state.to_string(),
        }
    }

    /// Shorthand for an `Exited` record.
    pub fn exited(state: &str) -> Self {
        TraceRecord::Exited {
            state: state.to_string(),
        }
    }
}

/// A [`TraceRecord`] plus when it was observed.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: TraceRecord,
}

/// Collects a machine's observer callbacks into an assertable log.
///
/// Clones share one log, so a recorder can outlive the builder it was
/// attached to and several machines can write into one log when a test
/// wants a merged view.
#[derive(Clone, Default)]
pub struct TraceRecorder {
    log: Arc<Mutex<Vec<TraceEntry>>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register entry, exit, and transition hooks on `builder` that feed
    /// this recorder, and hand the builder back.
    pub fn attach<C>(&self, mut builder: MachineBuilder<C>) -> MachineBuilder<C> {
        let log = self.log.clone();
        builder.observe_entry(move |ctx| {
            push(
                &log,
                TraceRecord::Entered {
                    state: ctx.state_name.to_string(),
                },
            );
        });
        let log = self.log.clone();
        builder.observe_exit(move |ctx| {
            push(
                &log,
                TraceRecord::Exited {
                    state: ctx.state_name.to_string(),
                },
            );
        });
        let log = self.log.clone();
        builder.observe_transition(move |ctx| {
            push(
                &log,
                TraceRecord::Fired {
                    source: ctx.source_name.to_string(),
                    target: ctx.target_name.to_string(),
                    event: ctx.event_name.map(str::to_string),
                },
            );
        });
        builder
    }

    /// Everything recorded so far, oldest first.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.lock().iter().map(|e| e.record.clone()).collect()
    }

    /// Timestamped records, oldest first.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.lock().clone()
    }

    /// Compact one-line-per-record rendering: `enter:X`, `exit:X`,
    /// `fire:A->B@Event` (`fire:A->B` for completions). Reads well in
    /// assertion diffs.
    pub fn names(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|e| match &e.record {
                TraceRecord::Entered { state } => format!("enter:{state}"),
                TraceRecord::Exited { state } => format!("exit:{state}"),
                TraceRecord::Fired {
                    source,
                    target,
                    event: Some(event),
                } => format!("fire:{source}->{target}@{event}"),
                TraceRecord::Fired {
                    source,
                    target,
                    event: None,
                } => format!("fire:{source}->{target}"),
            })
            .collect()
    }

    /// The states entered so far, in order. The usual shape of an
    /// end-to-end assertion.
    pub fn entered(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match &e.record {
                TraceRecord::Entered { state } => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Await `predicate` turning true over the records, polling as the
    /// machine works. Fails with a dump of the trace after `timeout`.
    pub async fn wait_until(
        &self,
        predicate: impl Fn(&[TraceRecord]) -> bool,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.records();
            if predicate(&records) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "trace predicate not satisfied within {timeout:?}; trace so far: {:?}",
                    self.names()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// The trace as pretty JSON, for snapshotting or debugging.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries())?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TraceEntry>> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecorder")
            .field("records", &self.len())
            .finish()
    }
}

fn push(log: &Arc<Mutex<Vec<TraceEntry>>>, record: TraceRecord) {
    log.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(TraceEntry {
            at: Utc::now(),
            record,
        });
}
