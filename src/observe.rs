//! Multicast observability hooks: entry, exit, and transition callbacks.
//!
//! Hooks are the push-style window into a running machine. External
//! collaborators (loggers, trace recorders, notifiers) register callbacks
//! before `start`; the worker invokes them synchronously inside the step,
//! in registration order, at three points:
//!
//! - **entry**: after a state's entry actions have run,
//! - **exit**: after a state's exit actions have run,
//! - **transition**: after a transition's action list has run (between the
//!   exit and entry phases for local/external transitions).
//!
//! # Guarantees
//!
//! - Hooks observe; they never alter runtime semantics. A panicking hook
//!   is reported through fault routing and the step proceeds untouched.
//! - Because hooks fire inside the step, the sequence they observe is
//!   exactly step order, never interleaved with another step of the same
//!   machine.
//!
//! # Registration Window
//!
//! Registration and unregistration happen on the [`MachineBuilder`] and
//! are frozen into the worker at `start`. Dynamic (un)registration on a
//! running machine is not supported; clients needing to toggle behavior
//! should branch inside their callback instead.
//!
//! [`MachineBuilder`]: crate::MachineBuilder

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::chart::{EventId, StateId, TransitionKind};
use crate::fault::panic_message;
use crate::machine::MachineId;

// =============================================================================
// Hook Contexts
// =============================================================================

/// Context passed to entry hooks: which machine entered which state.
#[derive(Debug, Clone, Copy)]
pub struct EnterCtx<'a> {
    pub machine: MachineId,
    pub machine_name: &'a str,
    pub state: StateId,
    pub state_name: &'a str,
}

/// Context passed to exit hooks: which machine left which state.
#[derive(Debug, Clone, Copy)]
pub struct ExitCtx<'a> {
    pub machine: MachineId,
    pub machine_name: &'a str,
    pub state: StateId,
    pub state_name: &'a str,
}

/// Context passed to transition hooks.
///
/// `event` is `None` for completion transitions (fired without an event).
#[derive(Debug, Clone, Copy)]
pub struct TransitionCtx<'a> {
    pub machine: MachineId,
    pub machine_name: &'a str,
    pub source: StateId,
    pub source_name: &'a str,
    pub target: StateId,
    pub target_name: &'a str,
    pub event: Option<EventId>,
    pub event_name: Option<&'a str>,
    pub kind: TransitionKind,
}

// =============================================================================
// Hook Registry
// =============================================================================

/// Identifies one registered hook so it can be unregistered before start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(usize);

type EnterHook = Arc<dyn Fn(&EnterCtx<'_>) + Send + Sync>;
type ExitHook = Arc<dyn Fn(&ExitCtx<'_>) + Send + Sync>;
type TransitionHook = Arc<dyn Fn(&TransitionCtx<'_>) + Send + Sync>;

/// Ordered collections of entry/exit/transition hooks for one machine.
///
/// Built on the machine builder, moved into the worker at start, and from
/// then on touched only by the worker.
#[derive(Default)]
pub(crate) struct HookSet {
    next_id: usize,
    enter: Vec<(HookId, EnterHook)>,
    exit: Vec<(HookId, ExitHook)>,
    transition: Vec<(HookId, TransitionHook)>,
}

impl HookSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn on_enter(
        &mut self,
        hook: impl Fn(&EnterCtx<'_>) + Send + Sync + 'static,
    ) -> HookId {
        let id = self.next_id();
        self.enter.push((id, Arc::new(hook)));
        id
    }

    pub(crate) fn on_exit(
        &mut self,
        hook: impl Fn(&ExitCtx<'_>) + Send + Sync + 'static,
    ) -> HookId {
        let id = self.next_id();
        self.exit.push((id, Arc::new(hook)));
        id
    }

    pub(crate) fn on_transition(
        &mut self,
        hook: impl Fn(&TransitionCtx<'_>) + Send + Sync + 'static,
    ) -> HookId {
        let id = self.next_id();
        self.transition.push((id, Arc::new(hook)));
        id
    }

    /// Remove a hook by id. Returns false if the id was never registered
    /// or was already removed.
    pub(crate) fn remove(&mut self, id: HookId) -> bool {
        let before = self.enter.len() + self.exit.len() + self.transition.len();
        self.enter.retain(|(h, _)| *h != id);
        self.exit.retain(|(h, _)| *h != id);
        self.transition.retain(|(h, _)| *h != id);
        before != self.enter.len() + self.exit.len() + self.transition.len()
    }

    /// Invoke every entry hook in registration order, isolating panics.
    /// Panic messages are handed to `on_panic` for fault routing.
    pub(crate) fn notify_enter(&self, ctx: &EnterCtx<'_>, mut on_panic: impl FnMut(String)) {
        for (_, hook) in &self.enter {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
                on_panic(panic_message(payload));
            }
        }
    }

    pub(crate) fn notify_exit(&self, ctx: &ExitCtx<'_>, mut on_panic: impl FnMut(String)) {
        for (_, hook) in &self.exit {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
                on_panic(panic_message(payload));
            }
        }
    }

    pub(crate) fn notify_transition(
        &self,
        ctx: &TransitionCtx<'_>,
        mut on_panic: impl FnMut(String),
    ) {
        for (_, hook) in &self.transition {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
                on_panic(panic_message(payload));
            }
        }
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("enter", &self.enter.len())
            .field("exit", &self.exit.len())
            .field("transition", &self.transition.len())
            .finish()
    }
}
