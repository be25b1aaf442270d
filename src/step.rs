//! The run-to-completion interpreter: one event in, one settled
//! configuration out.
//!
//! A [`Stepper`] owns a machine's mutable half (context, active state
//! path, history records) and executes steps strictly one at a time. The
//! machine worker drives it; nothing else ever touches it.
//!
//! ```text
//!   envelope ──▶ resolve ──▶ exit phase ──▶ actions ──▶ entry phase
//!                  │                                        │
//!               no match                              completion chain
//!                  │                                        │
//!               discard ◀───────── publish ◀────────────────┘
//! ```
//!
//! # Step Algorithm
//!
//! 1. Resolve: walk the active path leaf to top. For each state, try its
//!    internal transitions first, then local, then external, each in
//!    declaration order. The first transition whose trigger matches and
//!    whose guard passes wins; a deeper state always beats its ancestors.
//! 2. Exit: leave states leaf-first up to (not including) the transition
//!    domain, recording history on the way. History is captured from the
//!    configuration as it stood when the step began, before any exit
//!    action of that composite runs.
//! 3. Execute the transition's actions in declaration order.
//! 4. Enter: descend from the domain to the target, top-down, then follow
//!    defaults (or history) to a leaf.
//! 5. Drain completion transitions until none is enabled.
//! 6. Publish the new active path for observers on other threads.
//!
//! # Guarantees
//!
//! - Failing callbacks never unwind out of a step: action errors and
//!   panics are routed as faults, the rest of that action list is
//!   skipped, and the structural exit/entry sequence still completes.
//! - A guard that panics counts as "did not match" and resolution keeps
//!   searching.
//! - An event no active state cares about is discarded silently (debug
//!   log only).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::chart::{
    Action, Chart, EventId, Role, StateId, TransitionId, TransitionKind, TransitionNode,
};
use crate::error::RatchetError;
use crate::fault::{panic_message, Fault, FaultKind, FaultRouter};
use crate::machine::{MachineId, MachineShared};
use crate::mailbox::{Envelope, Mailbox, Payload};
use crate::observe::{EnterCtx, ExitCtx, HookSet, TransitionCtx};
use crate::timer::TimerService;

/// Ceiling on chained completion firings inside one step. A chart whose
/// completion transitions cycle forever would otherwise wedge the worker.
pub(crate) const COMPLETION_LIMIT: usize = 256;

// =============================================================================
// Trigger
// =============================================================================

/// What set the current step off: a posted event, or region completion.
pub struct Trigger {
    event: Option<EventId>,
    event_name: Option<Arc<str>>,
    payload: Option<Payload>,
}

impl Trigger {
    pub(crate) fn completion() -> Self {
        Self {
            event: None,
            event_name: None,
            payload: None,
        }
    }

    pub(crate) fn for_event(event: EventId, name: Arc<str>, payload: Option<Payload>) -> Self {
        Self {
            event: Some(event),
            event_name: Some(name),
            payload,
        }
    }

    /// The triggering event, `None` for completion steps.
    pub fn event(&self) -> Option<EventId> {
        self.event
    }

    /// Declared name of the triggering event.
    pub fn event_name(&self) -> Option<&str> {
        self.event_name.as_deref()
    }

    /// True when this step was fired by region completion, not an event.
    pub fn is_completion(&self) -> bool {
        self.event.is_none()
    }

    /// Downcast the payload the producer attached, if any.
    ///
    /// Returns `None` both when no payload was attached and when the
    /// payload is of a different type.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref())
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("event", &self.event)
            .field("event_name", &self.event_name)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

// =============================================================================
// Step Context
// =============================================================================

/// Handed to every guard-free callback (entry, exit, transition actions)
/// while it runs.
///
/// The context is the callback's line back into the runtime: inspect the
/// trigger, post follow-up events to this machine's own mailbox, or work
/// the timer. Follow-ups land at the back of the queue and run as their
/// own steps after the current one settles.
pub struct StepContext<'a> {
    trigger: &'a Trigger,
    machine: MachineId,
    machine_name: &'a str,
    mailbox: &'a Mailbox,
    timer: Option<&'a TimerService>,
}

impl<'a> StepContext<'a> {
    /// What set the current step off.
    pub fn trigger(&self) -> &Trigger {
        self.trigger
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    pub fn machine_name(&self) -> &str {
        self.machine_name
    }

    /// Post an event to this machine's own mailbox.
    ///
    /// The event is queued behind anything already waiting and handled in
    /// a later step, never inside the current one.
    pub fn raise(&self, event: EventId) -> Result<(), RatchetError> {
        self.mailbox.post(event)
    }

    /// Post an event with a payload to this machine's own mailbox.
    pub fn raise_with(&self, event: EventId, payload: Payload) -> Result<(), RatchetError> {
        self.mailbox.post_with(event, payload)
    }

    /// Arm a one-shot timer that posts `event` here after `delay`.
    /// Re-arming the same event replaces the earlier deadline.
    pub fn schedule(&self, event: EventId, delay: Duration) -> Result<(), RatchetError> {
        self.timer_service()?.schedule(self.mailbox, event, delay)
    }

    /// Arm a periodic timer: first fire after `delay`, then every
    /// `period` until cancelled.
    pub fn schedule_periodic(
        &self,
        event: EventId,
        delay: Duration,
        period: Duration,
    ) -> Result<(), RatchetError> {
        self.timer_service()?
            .schedule_periodic(self.mailbox, event, delay, period)
    }

    /// Disarm a pending timer for `event`. Returns whether one was
    /// pending; cancelling after the timer already fired is a no-op and
    /// does not recall the delivered event.
    pub fn cancel(&self, event: EventId) -> Result<bool, RatchetError> {
        Ok(self.timer_service()?.cancel(self.mailbox, event))
    }

    fn timer_service(&self) -> Result<&TimerService, RatchetError> {
        self.timer.ok_or_else(|| RatchetError::TimerUnavailable {
            machine: self.machine_name.to_string(),
        })
    }
}

impl fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("machine", &self.machine)
            .field("machine_name", &self.machine_name)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Stepper
// =============================================================================

/// The single-threaded heart of one machine: context, active path, and
/// history, mutated only by the owning worker.
pub(crate) struct Stepper<C> {
    chart: Arc<Chart<C>>,
    context: C,
    shared: Arc<MachineShared>,
    mailbox: Mailbox,
    timer: Option<TimerService>,
    hooks: HookSet,
    faults: FaultRouter,
    /// Active states from the top-level one down to the leaf.
    active: SmallVec<[StateId; 8]>,
    /// History pseudostate -> remembered state.
    history: HashMap<StateId, StateId>,
}

impl<C> Stepper<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chart: Arc<Chart<C>>,
        context: C,
        shared: Arc<MachineShared>,
        mailbox: Mailbox,
        timer: Option<TimerService>,
        hooks: HookSet,
        faults: FaultRouter,
    ) -> Self {
        Self {
            chart,
            context,
            shared,
            mailbox,
            timer,
            hooks,
            faults,
            active: SmallVec::new(),
            history: HashMap::new(),
        }
    }

    /// Enter the default configuration and settle completions. Runs once,
    /// before the first envelope is looked at.
    pub(crate) fn boot(&mut self) {
        let chart = self.chart.clone();
        let trigger = Trigger::completion();
        self.drill_default(&chart, Chart::<C>::ROOT, &trigger);
        self.run_completions(&chart);
        self.publish();
        trace!(
            machine = %self.shared.name,
            leaf = self.active.last().map(|&s| chart.state_name(s)),
            "booted",
        );
    }

    /// Process one envelope to quiescence.
    pub(crate) fn step(&mut self, envelope: Envelope) {
        let chart = self.chart.clone();
        if envelope.event.0 as usize >= chart.event_count() {
            warn!(
                machine = %self.shared.name,
                event = envelope.event.0,
                "event id does not belong to this chart; discarded",
            );
            return;
        }
        let trigger = Trigger::for_event(
            envelope.event,
            chart.event_label(envelope.event),
            envelope.payload,
        );
        match self.resolve(&chart, envelope.event, &trigger) {
            Some(tid) => {
                self.fire(&chart, tid, &trigger);
                self.run_completions(&chart);
            }
            None => {
                debug!(
                    machine = %self.shared.name,
                    event = chart.event_name(envelope.event),
                    "no active state handles event; discarded",
                );
            }
        }
        self.publish();
    }

    pub(crate) fn active(&self) -> &[StateId] {
        &self.active
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    fn resolve(&self, chart: &Chart<C>, event: EventId, trigger: &Trigger) -> Option<TransitionId> {
        const PASSES: [TransitionKind; 3] = [
            TransitionKind::Internal,
            TransitionKind::Local,
            TransitionKind::External,
        ];
        for &state in self.active.iter().rev() {
            for kind in PASSES {
                for &tid in chart.node(state).transitions.iter() {
                    let t = chart.transition(tid);
                    if t.synthetic || t.kind != kind || t.trigger != Some(event) {
                        continue;
                    }
                    if self.guard_passes(chart, tid, trigger) {
                        return Some(tid);
                    }
                }
            }
        }
        None
    }

    /// First enabled completion transition, child-most first. A simple
    /// leaf is complete the moment it is active; a composite is complete
    /// while its region sits in a final state.
    fn resolve_completion(&self, chart: &Chart<C>) -> Option<TransitionId> {
        const PASSES: [TransitionKind; 2] = [TransitionKind::Local, TransitionKind::External];
        let trigger = Trigger::completion();
        for (idx, &state) in self.active.iter().enumerate().rev() {
            let node = chart.node(state);
            if node.role == Role::Final {
                continue;
            }
            let complete = match self.active.get(idx + 1) {
                None => true,
                Some(&child) => chart.node(child).role == Role::Final,
            };
            if !complete {
                continue;
            }
            for kind in PASSES {
                for &tid in node.transitions.iter() {
                    let t = chart.transition(tid);
                    if t.synthetic || t.kind != kind || t.trigger.is_some() {
                        continue;
                    }
                    if self.guard_passes(chart, tid, &trigger) {
                        return Some(tid);
                    }
                }
            }
        }
        None
    }

    fn guard_passes(&self, chart: &Chart<C>, tid: TransitionId, trigger: &Trigger) -> bool {
        let t = chart.transition(tid);
        let Some(guard) = &t.guard else { return true };
        match catch_unwind(AssertUnwindSafe(|| guard(&self.context, trigger))) {
            Ok(pass) => pass,
            Err(payload) => {
                self.route_fault(
                    FaultKind::Guard,
                    Some(chart.node(t.source).name.clone()),
                    Some(t.label.clone()),
                    anyhow::anyhow!(panic_message(payload)),
                );
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Firing
    // -------------------------------------------------------------------------

    fn fire(&mut self, chart: &Chart<C>, tid: TransitionId, trigger: &Trigger) {
        let t = chart.transition(tid);
        trace!(machine = %self.shared.name, transition = %t.label, "firing");

        if t.kind == TransitionKind::Internal {
            self.run_actions(
                &t.actions,
                trigger,
                FaultKind::TransitionAction,
                None,
                Some(t.label.clone()),
            );
            self.notify_transition(chart, t, trigger);
            return;
        }

        let history_target = matches!(
            chart.node(t.target).role,
            Role::ShallowHistory | Role::DeepHistory
        );
        let effective = if history_target {
            chart.parent_raw(t.target)
        } else {
            t.target
        };

        // The domain is the innermost state left untouched. When source
        // and target sit on one ancestry line, an external transition
        // exits the outer of the two as well.
        let domain = match t.kind {
            TransitionKind::Local => t.source,
            _ => {
                let meet = chart.lca(t.source, effective);
                if meet == t.source || meet == effective {
                    chart.parent_raw(meet)
                } else {
                    meet
                }
            }
        };

        self.exit_to(chart, chart.depth(domain), trigger);
        self.run_actions(
            &t.actions,
            trigger,
            FaultKind::TransitionAction,
            None,
            Some(t.label.clone()),
        );
        if !t.synthetic {
            self.notify_transition(chart, t, trigger);
        }
        self.enter_target(chart, domain, t.target, trigger);
    }

    // -------------------------------------------------------------------------
    // Exit phase
    // -------------------------------------------------------------------------

    fn exit_to(&mut self, chart: &Chart<C>, domain_depth: u16, trigger: &Trigger) {
        // Snapshot before anything is popped: history records what was
        // active when the step began, not what is left mid-exit.
        let pre: SmallVec<[StateId; 8]> = self.active.clone();
        while self.active.len() > domain_depth as usize {
            let Some(&sid) = self.active.last() else { break };
            self.record_history(chart, sid, &pre);
            let node = chart.node(sid);
            self.run_actions(
                &node.exit,
                trigger,
                FaultKind::Exit,
                Some(node.name.clone()),
                None,
            );
            self.notify_exit(chart, sid);
            self.active.pop();
        }
    }

    fn record_history(&mut self, chart: &Chart<C>, exiting: StateId, pre: &[StateId]) {
        let node = chart.node(exiting);
        for &h in node.histories.iter() {
            let remembered = match chart.node(h).role {
                Role::DeepHistory => pre.last().copied(),
                _ => pre.get(chart.depth(exiting) as usize).copied(),
            };
            if let Some(state) = remembered {
                self.history.insert(h, state);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entry phase
    // -------------------------------------------------------------------------

    fn enter_target(
        &mut self,
        chart: &Chart<C>,
        domain: StateId,
        target: StateId,
        trigger: &Trigger,
    ) {
        match chart.node(target).role {
            Role::ShallowHistory => {
                let owner = chart.parent_raw(target);
                self.enter_chain(chart, domain, owner, trigger);
                match self.history.get(&target).copied() {
                    Some(child) => {
                        self.enter_one(chart, child, trigger);
                        self.drill_default(chart, child, trigger);
                    }
                    None => self.drill_default(chart, owner, trigger),
                }
            }
            Role::DeepHistory => {
                let owner = chart.parent_raw(target);
                self.enter_chain(chart, domain, owner, trigger);
                match self.history.get(&target).copied() {
                    Some(leaf) => {
                        self.enter_chain(chart, owner, leaf, trigger);
                        self.drill_default(chart, leaf, trigger);
                    }
                    None => self.drill_default(chart, owner, trigger),
                }
            }
            _ => {
                self.enter_chain(chart, domain, target, trigger);
                self.drill_default(chart, target, trigger);
            }
        }
    }

    /// Enter every state strictly below `above` on the path to `until`,
    /// including `until` itself, top-down.
    fn enter_chain(&mut self, chart: &Chart<C>, above: StateId, until: StateId, trigger: &Trigger) {
        let mut chain: SmallVec<[StateId; 8]> = SmallVec::new();
        let mut cursor = until;
        while chart.depth(cursor) > chart.depth(above) {
            chain.push(cursor);
            cursor = chart.parent_raw(cursor);
        }
        for &state in chain.iter().rev() {
            self.enter_one(chart, state, trigger);
        }
    }

    /// Follow initial pseudostates from `from` down to a leaf.
    fn drill_default(&mut self, chart: &Chart<C>, from: StateId, trigger: &Trigger) {
        let mut cursor = from;
        while let Some(init) = chart.node(cursor).initial {
            let Some(&tid) = chart.node(init).transitions.first() else {
                break;
            };
            let next = chart.transition(tid).target;
            self.enter_one(chart, next, trigger);
            cursor = next;
        }
    }

    fn enter_one(&mut self, chart: &Chart<C>, state: StateId, trigger: &Trigger) {
        self.active.push(state);
        let node = chart.node(state);
        self.run_actions(
            &node.entry,
            trigger,
            FaultKind::Entry,
            Some(node.name.clone()),
            None,
        );
        self.notify_enter(chart, state);
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    fn run_completions(&mut self, chart: &Chart<C>) {
        for _ in 0..COMPLETION_LIMIT {
            let Some(tid) = self.resolve_completion(chart) else {
                return;
            };
            self.fire(chart, tid, &Trigger::completion());
        }
        self.route_fault(
            FaultKind::CompletionLimit,
            self.active.last().map(|&s| chart.node(s).name.clone()),
            None,
            anyhow::anyhow!(
                "completion transitions still enabled after {COMPLETION_LIMIT} chained firings"
            ),
        );
    }

    // -------------------------------------------------------------------------
    // Callback plumbing
    // -------------------------------------------------------------------------

    /// Run one action list in order. The first failure (error or panic)
    /// is routed as a fault and the rest of the list is skipped; the
    /// surrounding step continues regardless.
    fn run_actions(
        &mut self,
        actions: &[Action<C>],
        trigger: &Trigger,
        kind: FaultKind,
        state: Option<Arc<str>>,
        transition: Option<Arc<str>>,
    ) {
        if actions.is_empty() {
            return;
        }
        let ctx = StepContext {
            trigger,
            machine: self.shared.id,
            machine_name: &self.shared.name,
            mailbox: &self.mailbox,
            timer: self.timer.as_ref(),
        };
        for action in actions {
            match catch_unwind(AssertUnwindSafe(|| action(&mut self.context, &ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.route_fault(kind, state.clone(), transition.clone(), error);
                    break;
                }
                Err(payload) => {
                    self.route_fault(
                        kind,
                        state.clone(),
                        transition.clone(),
                        anyhow::anyhow!(panic_message(payload)),
                    );
                    break;
                }
            }
        }
    }

    fn notify_enter(&self, chart: &Chart<C>, state: StateId) {
        let ctx = EnterCtx {
            machine: self.shared.id,
            machine_name: &self.shared.name,
            state,
            state_name: chart.state_name(state),
        };
        self.hooks.notify_enter(&ctx, |message| {
            self.route_fault(
                FaultKind::Observer,
                Some(chart.node(state).name.clone()),
                None,
                anyhow::anyhow!(message),
            );
        });
    }

    fn notify_exit(&self, chart: &Chart<C>, state: StateId) {
        let ctx = ExitCtx {
            machine: self.shared.id,
            machine_name: &self.shared.name,
            state,
            state_name: chart.state_name(state),
        };
        self.hooks.notify_exit(&ctx, |message| {
            self.route_fault(
                FaultKind::Observer,
                Some(chart.node(state).name.clone()),
                None,
                anyhow::anyhow!(message),
            );
        });
    }

    fn notify_transition(&self, chart: &Chart<C>, t: &TransitionNode<C>, trigger: &Trigger) {
        let ctx = TransitionCtx {
            machine: self.shared.id,
            machine_name: &self.shared.name,
            source: t.source,
            source_name: chart.state_name(t.source),
            target: t.target,
            target_name: chart.state_name(t.target),
            event: trigger.event(),
            event_name: trigger.event_name(),
            kind: t.kind,
        };
        self.hooks.notify_transition(&ctx, |message| {
            self.route_fault(
                FaultKind::Observer,
                None,
                Some(t.label.clone()),
                anyhow::anyhow!(message),
            );
        });
    }

    fn route_fault(
        &self,
        kind: FaultKind,
        state: Option<Arc<str>>,
        transition: Option<Arc<str>>,
        error: anyhow::Error,
    ) {
        self.faults.route(Fault {
            machine: self.shared.id,
            machine_name: self.shared.name.clone(),
            state,
            transition,
            kind,
            error,
            at: Utc::now(),
        });
    }

    /// Copy the active path into the shared snapshot other threads read.
    fn publish(&self) {
        let mut snapshot = self
            .shared
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshot.clear();
        snapshot.extend(self.active.iter().copied());
    }
}

impl<C> fmt::Debug for Stepper<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stepper")
            .field("machine", &self.shared.id)
            .field("name", &self.shared.name)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
