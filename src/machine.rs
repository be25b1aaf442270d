//! Machine instances: one chart, one context, one worker, one mailbox.
//!
//! A [`Machine`] binds an immutable [`Chart`] to a mutable context value
//! and runs it on a dedicated worker task. All steps of one machine
//! execute on that worker, strictly one at a time; concurrency lives
//! between machines, never inside one.
//!
//! ```text
//!   MachineBuilder ──build()──▶ Machine ──start()──▶ worker task
//!                                  │                    │
//!                            post(event) ─────────▶ mailbox ─▶ step
//!                                  │                    │
//!                               stop().await ◀──── drains & exits
//! ```
//!
//! # Lifecycle
//!
//! Idle -> Running -> Stopping -> Stopped, one way only. A machine runs
//! at most once; after `stop()` it stays stopped and a fresh instance is
//! the way to run the same chart again. `start()` on a non-idle machine
//! and `stop()` on a stopped one are logged no-ops.
//!
//! # Guarantees
//!
//! - The initial configuration is entered (and its completion chain
//!   settled) before the first posted event is looked at.
//! - `stop()` resolves only after the worker has exited; events still
//!   queued at that point are dropped.
//! - Observer hooks are frozen at start: registration happens on the
//!   builder, and the running worker never takes a registration lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use serde::Serialize;
use smallvec::SmallVec;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::chart::{Chart, EventId, StateId};
use crate::error::RatchetError;
use crate::fault::FaultRouter;
use crate::mailbox::{self, Mailbox, MailboxReceiver, Payload};
use crate::observe::{EnterCtx, ExitCtx, HookId, HookSet, TransitionCtx};
use crate::step::Stepper;
use crate::timer::TimerService;

// =============================================================================
// Identity & Lifecycle
// =============================================================================

/// Unique id of one machine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MachineId(Uuid);

impl MachineId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a machine stands in its one-way run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Built, not yet started. The mailbox refuses events.
    Idle,
    /// Worker up, events accepted and stepped.
    Running,
    /// `stop()` requested; the worker is on its way out.
    Stopping,
    /// Worker gone. Terminal.
    Stopped,
}

/// State shared between the machine handle, its mailbox, its worker, and
/// the timer service.
pub(crate) struct MachineShared {
    pub(crate) id: MachineId,
    pub(crate) name: Arc<str>,
    pub(crate) lifecycle: AtomicU8,
    /// Active path as of the last settled step, root-most first.
    pub(crate) snapshot: RwLock<SmallVec<[StateId; 8]>>,
}

impl MachineShared {
    pub(crate) const IDLE: u8 = 0;
    pub(crate) const RUNNING: u8 = 1;
    pub(crate) const STOPPING: u8 = 2;
    pub(crate) const STOPPED: u8 = 3;

    pub(crate) fn new(name: &str) -> Self {
        Self {
            id: MachineId::new(),
            name: Arc::from(name),
            lifecycle: AtomicU8::new(Self::IDLE),
            snapshot: RwLock::new(SmallVec::new()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == Self::RUNNING
    }

    #[cfg(test)]
    pub(crate) fn set_running_for_tests(&self) {
        self.lifecycle.store(Self::RUNNING, Ordering::Release);
    }
}

// =============================================================================
// Machine
// =============================================================================

/// Everything the worker needs but the handle must give up at start.
struct Boot<C> {
    receiver: MailboxReceiver,
    context: C,
    hooks: HookSet,
    timer: Option<TimerService>,
    faults: FaultRouter,
}

/// A running (or runnable) statechart instance.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
///
/// # Example
///
/// ```ignore
/// let machine = Machine::builder(chart, Context::default())
///     .with_name("player-42")
///     .build();
/// machine.start();
/// machine.post(milestone_met)?;
/// machine.stop().await;
/// ```
pub struct Machine<C> {
    shared: Arc<MachineShared>,
    chart: Arc<Chart<C>>,
    mailbox: Mailbox,
    boot: StdMutex<Option<Boot<C>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl<C> Machine<C> {
    /// Start building a machine for `chart` with the given initial
    /// context.
    pub fn builder(chart: impl Into<Arc<Chart<C>>>, context: C) -> MachineBuilder<C> {
        MachineBuilder::new(chart, context)
    }

    pub fn id(&self) -> MachineId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn chart(&self) -> &Chart<C> {
        &self.chart
    }

    /// A posting handle usable from any thread or task.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Post an event to this machine.
    pub fn post(&self, event: EventId) -> Result<(), RatchetError> {
        self.mailbox.post(event)
    }

    /// Post an event with a payload.
    pub fn post_with(&self, event: EventId, payload: Payload) -> Result<(), RatchetError> {
        self.mailbox.post_with(event, payload)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.shared.lifecycle.load(Ordering::Acquire) {
            MachineShared::IDLE => Lifecycle::Idle,
            MachineShared::RUNNING => Lifecycle::Running,
            MachineShared::STOPPING => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// The active path as of the last settled step, outermost state
    /// first. Empty before the first step of a started machine settles.
    pub fn active_states(&self) -> Vec<StateId> {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .to_vec()
    }

    /// The innermost active state, if any step has settled yet.
    pub fn active_leaf(&self) -> Option<StateId> {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .copied()
    }

    /// True while `state` is on the active path. Composites count as
    /// active while any of their descendants is.
    pub fn is_in_state(&self, state: StateId) -> bool {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&state)
    }

    /// Name-based [`is_in_state`](Machine::is_in_state). Unknown names
    /// are simply not active.
    pub fn is_in_state_named(&self, name: &str) -> bool {
        match self.chart.state_id(name) {
            Some(state) => self.is_in_state(state),
            None => false,
        }
    }
}

impl<C: Send + 'static> Machine<C> {
    /// Spawn the worker and begin accepting events.
    ///
    /// Must be called inside a tokio runtime. The worker enters the
    /// default configuration before it reads its first envelope, so
    /// events posted immediately after `start()` cannot overtake the
    /// initial entry chain. Calling `start` on a machine that is not
    /// idle is a logged no-op.
    pub fn start(&self) {
        if self
            .shared
            .lifecycle
            .compare_exchange(
                MachineShared::IDLE,
                MachineShared::RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(machine = %self.shared.name, "start ignored; machine is not idle");
            return;
        }

        let boot = self
            .boot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(boot) = boot else {
            // Unreachable while the lifecycle CAS guards this path.
            error!(machine = %self.shared.name, "boot payload missing; machine cannot start");
            return;
        };

        info!(machine = %self.shared.name, id = %self.shared.id, "machine starting");
        let stepper = Stepper::new(
            self.chart.clone(),
            boot.context,
            self.shared.clone(),
            self.mailbox.clone(),
            boot.timer,
            boot.hooks,
            boot.faults,
        );
        let handle = tokio::spawn(run_worker(
            stepper,
            boot.receiver,
            self.shared.clone(),
            self.shutdown.clone(),
        ));

        match self.worker.try_lock() {
            Ok(mut slot) => *slot = Some(handle),
            // stop() already holds the slot; it has flagged the lifecycle,
            // so the fresh worker will notice and exit on its own.
            Err(_) => debug!(machine = %self.shared.name, "stop raced start"),
        }
    }

    /// Ask the worker to finish its current step and exit, then wait for
    /// it. Residual queued events are dropped. Safe to call repeatedly
    /// and from several tasks; later callers wait for the first to
    /// finish.
    pub async fn stop(&self) {
        let mut slot = self.worker.lock().await;

        // Never started: nothing to wait for.
        if self
            .shared
            .lifecycle
            .compare_exchange(
                MachineShared::IDLE,
                MachineShared::STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(machine = %self.shared.name, "machine stopped without ever starting");
            return;
        }

        if self
            .shared
            .lifecycle
            .compare_exchange(
                MachineShared::RUNNING,
                MachineShared::STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.shutdown.notify_one();
        }

        if let Some(handle) = slot.take() {
            if let Err(err) = handle.await {
                error!(machine = %self.shared.name, error = %err, "worker ended abnormally");
            }
        }

        self.shared
            .lifecycle
            .store(MachineShared::STOPPED, Ordering::Release);
        info!(machine = %self.shared.name, "machine stopped");
    }
}

impl<C> fmt::Debug for Machine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

async fn run_worker<C>(
    mut stepper: Stepper<C>,
    mut receiver: MailboxReceiver,
    shared: Arc<MachineShared>,
    shutdown: Arc<Notify>,
) {
    stepper.boot();
    loop {
        if shared.lifecycle.load(Ordering::Acquire) >= MachineShared::STOPPING {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            next = receiver.recv() => match next {
                Some(envelope) => stepper.step(envelope),
                None => break,
            },
        }
    }
    debug!(machine = %shared.name, "worker exited");
}

// =============================================================================
// Machine Builder
// =============================================================================

/// Configures one machine instance before it exists.
///
/// Observer hooks are registered here and frozen at
/// [`build`](MachineBuilder::build); there is no registration after
/// start.
pub struct MachineBuilder<C> {
    chart: Arc<Chart<C>>,
    context: C,
    name: Option<String>,
    capacity: Option<usize>,
    timer: Option<TimerService>,
    faults: Option<FaultRouter>,
    hooks: HookSet,
}

impl<C> MachineBuilder<C> {
    pub fn new(chart: impl Into<Arc<Chart<C>>>, context: C) -> Self {
        Self {
            chart: chart.into(),
            context,
            name: None,
            capacity: None,
            timer: None,
            faults: None,
            hooks: HookSet::new(),
        }
    }

    /// Name the instance. Defaults to the chart name; useful when many
    /// machines run the same chart.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Switch the mailbox to a bounded queue of `capacity` envelopes.
    /// Overflow is rejected with [`RatchetError::MailboxFull`], never
    /// dropped silently.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Attach a timer service so actions can `schedule` and `cancel`.
    pub fn with_timer(mut self, timer: &TimerService) -> Self {
        self.timer = Some(timer.clone());
        self
    }

    /// Route this machine's faults through `router` instead of a private
    /// handlerless one.
    pub fn with_fault_router(mut self, router: &FaultRouter) -> Self {
        self.faults = Some(router.clone());
        self
    }

    /// Observe every state entry, after the state's entry actions ran.
    pub fn observe_entry(
        &mut self,
        hook: impl Fn(&EnterCtx<'_>) + Send + Sync + 'static,
    ) -> HookId {
        self.hooks.on_enter(hook)
    }

    /// Observe every state exit, after the state's exit actions ran.
    pub fn observe_exit(&mut self, hook: impl Fn(&ExitCtx<'_>) + Send + Sync + 'static) -> HookId {
        self.hooks.on_exit(hook)
    }

    /// Observe every non-synthetic transition, after its actions ran.
    pub fn observe_transition(
        &mut self,
        hook: impl Fn(&TransitionCtx<'_>) + Send + Sync + 'static,
    ) -> HookId {
        self.hooks.on_transition(hook)
    }

    /// Drop a previously registered hook. Returns whether it existed.
    pub fn unobserve(&mut self, id: HookId) -> bool {
        self.hooks.remove(id)
    }

    pub fn build(self) -> Machine<C> {
        let name = self
            .name
            .unwrap_or_else(|| self.chart.name().to_string());
        let shared = Arc::new(MachineShared::new(&name));
        let (mailbox, receiver) = mailbox::channel(shared.clone(), self.capacity);
        Machine {
            shared,
            chart: self.chart,
            mailbox,
            boot: StdMutex::new(Some(Boot {
                receiver,
                context: self.context,
                hooks: self.hooks,
                timer: self.timer,
                faults: self.faults.unwrap_or_default(),
            })),
            worker: tokio::sync::Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

impl<C> fmt::Debug for MachineBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineBuilder")
            .field("chart", &self.chart.name())
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("timer", &self.timer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartBuilder;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Counter = Arc<AtomicUsize>;

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn two_state_chart() -> (Chart<Counter>, EventId) {
        let mut b = ChartBuilder::<Counter>::new("pair");
        let go = b.event("Go");
        let a = b.state("A");
        let z = b.state("Z");
        b.initial(a);
        b.on_entry(z, |hits, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        b.external().from(a).to(z).on(go).done();
        (b.build().unwrap(), go)
    }

    #[tokio::test]
    async fn start_boots_then_steps_posted_events() {
        let (chart, go) = two_state_chart();
        let hits: Counter = Arc::default();
        let machine = Machine::builder(chart, hits.clone()).build();

        assert_eq!(machine.lifecycle(), Lifecycle::Idle);
        machine.start();
        eventually(|| machine.active_leaf().is_some()).await;
        assert!(machine.is_in_state_named("A"));

        machine.post(go).unwrap();
        eventually(|| machine.is_in_state_named("Z")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        machine.stop().await;
        assert_eq!(machine.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn posting_before_start_and_after_stop_is_refused() {
        let (chart, go) = two_state_chart();
        let machine = Machine::builder(chart, Counter::default()).build();

        assert!(matches!(
            machine.post(go).unwrap_err(),
            RatchetError::NotRunning { .. }
        ));

        machine.start();
        eventually(|| machine.active_leaf().is_some()).await;
        machine.stop().await;

        assert!(matches!(
            machine.post(go).unwrap_err(),
            RatchetError::NotRunning { .. }
        ));
    }

    #[tokio::test]
    async fn second_start_does_not_reboot() {
        let mut b = ChartBuilder::<Counter>::new("once");
        let a = b.state("A");
        b.initial(a);
        b.on_entry(a, |hits, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let hits: Counter = Arc::default();
        let machine = Machine::builder(b.build().unwrap(), hits.clone()).build();

        machine.start();
        machine.start();
        eventually(|| machine.active_leaf().is_some()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        machine.stop().await;
        machine.start();
        assert_eq!(machine.lifecycle(), Lifecycle::Stopped);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_waits_for_the_worker() {
        let (chart, go) = two_state_chart();
        let machine = Arc::new(Machine::builder(chart, Counter::default()).build());

        machine.start();
        eventually(|| machine.active_leaf().is_some()).await;
        machine.post(go).unwrap();

        machine.stop().await;
        machine.stop().await;
        assert_eq!(machine.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn stopping_an_unstarted_machine_just_marks_it_stopped() {
        let (chart, _) = two_state_chart();
        let machine = Machine::builder(chart, Counter::default()).build();
        machine.stop().await;
        assert_eq!(machine.lifecycle(), Lifecycle::Stopped);
        machine.start();
        assert_eq!(machine.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn active_path_includes_every_ancestor() {
        let mut b = ChartBuilder::<Counter>::new("nested");
        let outer = b.state("Outer");
        let inner = b.child(outer, "Inner");
        b.initial(outer);
        b.initial(inner);
        let machine = Machine::builder(b.build().unwrap(), Counter::default()).build();

        machine.start();
        eventually(|| machine.active_leaf().is_some()).await;

        assert!(machine.is_in_state_named("Outer"));
        assert!(machine.is_in_state_named("Inner"));
        assert_eq!(machine.active_states().len(), 2);
        assert!(!machine.is_in_state_named("NoSuchState"));

        machine.stop().await;
    }

    #[tokio::test]
    async fn builder_names_and_hooks_stick() {
        let (chart, go) = two_state_chart();
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();

        let mut builder = Machine::builder(chart, Counter::default()).with_name("pair-7");
        builder.observe_transition(move |ctx| {
            sink.lock().unwrap().push(format!(
                "{}->{}",
                ctx.source_name, ctx.target_name
            ));
        });
        let machine = builder.build();
        assert_eq!(machine.name(), "pair-7");

        machine.start();
        eventually(|| machine.active_leaf().is_some()).await;
        machine.post(go).unwrap();
        eventually(|| machine.is_in_state_named("Z")).await;
        machine.stop().await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["A->Z"]);
    }

    #[tokio::test]
    async fn removed_hooks_never_fire() {
        let (chart, go) = two_state_chart();
        let seen: Counter = Arc::default();
        let sink = seen.clone();

        let mut builder = Machine::builder(chart, Counter::default());
        let id = builder.observe_transition(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        assert!(builder.unobserve(id));
        assert!(!builder.unobserve(id));
        let machine = builder.build();

        machine.start();
        eventually(|| machine.active_leaf().is_some()).await;
        machine.post(go).unwrap();
        eventually(|| machine.is_in_state_named("Z")).await;
        machine.stop().await;

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
