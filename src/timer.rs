//! Deferred and periodic event delivery.
//!
//! A [`TimerService`] runs one clock task that any number of machines
//! share. Arming a timer records a `(machine, event)` entry; when the
//! deadline passes, the clock posts the event to the machine's mailbox
//! like any other producer. From the machine's point of view a timeout is
//! just an event that arrives later.
//!
//! ```text
//!   schedule(mailbox, event, delay) ──▶ clock task ──deadline──▶ mailbox
//!   cancel(mailbox, event)          ──▶ disarm (no-op once fired)
//! ```
//!
//! # Key Invariants
//!
//! - One pending timer per `(machine, event)` pair: scheduling again
//!   replaces the earlier deadline rather than stacking a second fire.
//! - Cancelling something that already fired (or was never armed) is a
//!   harmless no-op; a delivered event is never recalled.
//! - Deadlines are monotonic instants, immune to wall-clock jumps.
//! - Periodic timers keep a fixed cadence (`deadline + period`, not
//!   `fired_at + period`) and stay armed until cancelled.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::chart::EventId;
use crate::error::RatchetError;
use crate::machine::MachineId;
use crate::mailbox::{Mailbox, Payload};

type TimerKey = (MachineId, EventId);

/// Shared handle to one clock task.
///
/// Cheap to clone; all clones drive the same clock. Created inside a
/// tokio runtime (construction spawns the clock task). Dropping the last
/// handle shuts the clock down on its own; call
/// [`shutdown`](TimerService::shutdown) to wait for it deliberately.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    tx: mpsc::UnboundedSender<TimerCmd>,
    /// Armed `(machine, event)` pairs and the generation that owns them.
    /// The heap inside the clock task may hold stale entries; this map is
    /// the source of truth.
    pending: Arc<DashMap<TimerKey, u64>>,
    seq: AtomicU64,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

enum TimerCmd {
    Arm(Pending),
    Shutdown,
}

struct Pending {
    key: TimerKey,
    /// Ties this heap entry to the `pending` map; a mismatch means the
    /// timer was cancelled or replaced after this entry was queued.
    generation: u64,
    deadline: Instant,
    period: Option<Duration>,
    payload: Option<Payload>,
    mailbox: Mailbox,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl TimerService {
    /// Spawn the clock task. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Arc<DashMap<TimerKey, u64>> = Arc::new(DashMap::new());
        let worker = tokio::spawn(run_clock(rx, pending.clone()));
        Self {
            inner: Arc::new(TimerInner {
                tx,
                pending,
                seq: AtomicU64::new(0),
                worker: tokio::sync::Mutex::new(Some(worker)),
            }),
        }
    }

    /// Arm a one-shot timer: post `event` to `target` after `delay`.
    ///
    /// An already-armed timer for the same `(machine, event)` pair is
    /// replaced, deadline included.
    pub fn schedule(
        &self,
        target: &Mailbox,
        event: EventId,
        delay: Duration,
    ) -> Result<(), RatchetError> {
        self.arm(target, event, delay, None, None)
    }

    /// Like [`schedule`](TimerService::schedule), with a payload the
    /// fired event carries into the mailbox.
    pub fn schedule_with(
        &self,
        target: &Mailbox,
        event: EventId,
        delay: Duration,
        payload: Payload,
    ) -> Result<(), RatchetError> {
        self.arm(target, event, delay, None, Some(payload))
    }

    /// Arm a periodic timer: first fire after `delay`, then every
    /// `period` until cancelled. A zero period is demoted to a one-shot.
    pub fn schedule_periodic(
        &self,
        target: &Mailbox,
        event: EventId,
        delay: Duration,
        period: Duration,
    ) -> Result<(), RatchetError> {
        if period.is_zero() {
            warn!(
                machine = %target.machine_name(),
                "periodic timer with zero period; arming as one-shot",
            );
            return self.arm(target, event, delay, None, None);
        }
        self.arm(target, event, delay, Some(period), None)
    }

    /// Disarm the pending timer for `(target, event)`. Returns whether
    /// one was pending. After a one-shot fired this is a no-op: the
    /// posted event is already in the mailbox and stays there.
    pub fn cancel(&self, target: &Mailbox, event: EventId) -> bool {
        self.inner
            .pending
            .remove(&(target.machine(), event))
            .is_some()
    }

    /// Number of currently armed timers, across all machines. Mostly
    /// useful in tests and diagnostics.
    pub fn armed_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop the clock task and wait for it. Armed timers are discarded;
    /// further scheduling through any clone fails with
    /// [`RatchetError::TimerStopped`].
    pub async fn shutdown(&self) {
        // An Err here means the clock is already gone.
        let _ = self.inner.tx.send(TimerCmd::Shutdown);
        let handle = self
            .inner
            .worker
            .lock()
            .await
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "timer clock ended abnormally");
            }
        }
    }

    fn arm(
        &self,
        target: &Mailbox,
        event: EventId,
        delay: Duration,
        period: Option<Duration>,
        payload: Option<Payload>,
    ) -> Result<(), RatchetError> {
        let key = (target.machine(), event);
        let generation = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        // Insert replaces any earlier generation, which orphans its heap
        // entry; the clock skips orphans when they surface.
        self.inner.pending.insert(key, generation);
        self.inner
            .tx
            .send(TimerCmd::Arm(Pending {
                key,
                generation,
                deadline: Instant::now() + delay,
                period,
                payload,
                mailbox: target.clone(),
            }))
            .map_err(|_| RatchetError::TimerStopped)
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("armed", &self.armed_count())
            .finish_non_exhaustive()
    }
}

async fn run_clock(
    mut rx: mpsc::UnboundedReceiver<TimerCmd>,
    pending: Arc<DashMap<TimerKey, u64>>,
) {
    let mut heap: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
    loop {
        let next = heap.peek().map(|Reverse(p)| p.deadline);
        let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(TimerCmd::Arm(entry)) => heap.push(Reverse(entry)),
                Some(TimerCmd::Shutdown) | None => break,
            },
            _ = sleep_until(wake), if next.is_some() => {
                let now = Instant::now();
                while heap.peek().is_some_and(|Reverse(p)| p.deadline <= now) {
                    let Some(Reverse(entry)) = heap.pop() else { break };
                    fire(&pending, &mut heap, entry);
                }
            }
        }
    }
    debug!("timer clock exited");
}

fn fire(pending: &DashMap<TimerKey, u64>, heap: &mut BinaryHeap<Reverse<Pending>>, entry: Pending) {
    let current = pending.get(&entry.key).map(|generation| *generation);
    if current != Some(entry.generation) {
        // Cancelled or replaced since this entry was queued.
        return;
    }
    let event = entry.key.1;
    let posted = match &entry.payload {
        Some(payload) => entry.mailbox.post_with(event, payload.clone()),
        None => entry.mailbox.post(event),
    };
    match posted {
        Ok(()) => match entry.period {
            Some(period) => {
                // Same generation: one cancel() disarms the whole series.
                let deadline = entry.deadline + period;
                heap.push(Reverse(Pending { deadline, ..entry }));
            }
            None => {
                pending.remove_if(&entry.key, |_, generation| *generation == entry.generation);
            }
        },
        Err(err) => {
            warn!(
                machine = %entry.mailbox.machine_name(),
                error = %err,
                "timer fired into an unavailable mailbox; disarmed",
            );
            pending.remove_if(&entry.key, |_, generation| *generation == entry.generation);
        }
    }
}
