//! Statechart tables: the state tree, events, and transitions of one
//! machine design.
//!
//! A [`Chart`] is the immutable, declarative description a machine runs:
//! states (simple, composite, final) arranged in a tree, initial and
//! history pseudostates, declared events, and guarded transitions with
//! ordered action lists. Machines never subclass behavior: a variant is a
//! different table, produced either from scratch or by cloning a base
//! [`ChartBuilder`] and layering more transitions onto it before `build()`.
//!
//! ```text
//!   ChartBuilder ── declare ──▶ states / events / transitions (drafts)
//!        │
//!      build() ── validate ──▶ Chart (immutable, Arc-shared)
//!        │
//!        ▼
//!   Machine::builder(chart, context) … one chart, many machines
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut b = ChartBuilder::<Player>::new("player");
//!
//! let milestone = b.event("MilestoneMet");
//! let take_a_break = b.state("TakeABreak");
//! let break_over = b.state("BreakOver");
//! let work = b.child(break_over, "WorkHard");
//! let play = b.child(break_over, "PlayHard");
//!
//! b.initial(take_a_break);   // root region default
//! b.initial(work);           // BreakOver region default
//! b.deep_history(break_over);
//!
//! b.external().from(work).to(play).on(milestone).done();
//!
//! let chart = b.build()?;
//! ```
//!
//! # Key Invariants
//!
//! - A chart that builds is structurally sound: every region has exactly
//!   one initial pseudostate, pseudostates carry no actions and source no
//!   transitions, final states source nothing, local transitions stay
//!   inside their source.
//! - Ids (`StateId`, `EventId`, `TransitionId`) are plain indexes into the
//!   owning chart's tables and are only meaningful with that chart.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;

use crate::error::ChartError;
use crate::step::{StepContext, Trigger};

// =============================================================================
// Identifiers
// =============================================================================

/// Identifies an event declared on one chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventId(pub(crate) u32);

/// Identifies a state (or pseudostate) of one chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StateId(pub(crate) u32);

/// Identifies a transition of one chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransitionId(pub(crate) u32);

impl StateId {
    #[cfg(test)]
    pub(crate) fn for_tests(index: u32) -> Self {
        Self(index)
    }
}

// =============================================================================
// Kinds & Callback Aliases
// =============================================================================

/// Public classification of a state.
///
/// Simple vs Composite is derived: a plain state becomes Composite the
/// moment it is given child states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateKind {
    Simple,
    Composite,
    Initial,
    Final,
    ShallowHistory,
    DeepHistory,
}

/// The three transition flavors, in resolution-precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransitionKind {
    /// Runs its actions without exiting or entering any state.
    Internal,
    /// Exits and re-enters only within the source composite, never the
    /// source itself.
    Local,
    /// Full exit up to the source/target boundary and full entry down to
    /// the target.
    External,
}

/// Guard predicate: read-only look at the machine context and the trigger.
///
/// Guards decide; they do not act. A guard that panics is routed as a
/// fault and treated as "did not match".
pub type Guard<C> = Arc<dyn Fn(&C, &Trigger) -> bool + Send + Sync>;

/// Action callback: mutates the machine context, may post or schedule
/// follow-up events through the [`StepContext`], and reports failure by
/// returning an error (or panicking; both are routed as faults).
pub type Action<C> = Arc<dyn Fn(&mut C, &StepContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Internal role of a state node. `Plain` covers both Simple and
/// Composite; the split is derived from children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Plain,
    Final,
    Initial,
    ShallowHistory,
    DeepHistory,
}

impl Role {
    pub(crate) fn is_pseudo(self) -> bool {
        matches!(self, Role::Initial | Role::ShallowHistory | Role::DeepHistory)
    }

    pub(crate) fn is_real(self) -> bool {
        matches!(self, Role::Plain | Role::Final)
    }
}

// =============================================================================
// Chart Tables
// =============================================================================

pub(crate) struct StateNode<C> {
    pub(crate) name: Arc<str>,
    pub(crate) parent: Option<StateId>,
    pub(crate) role: Role,
    pub(crate) depth: u16,
    pub(crate) children: SmallVec<[StateId; 4]>,
    pub(crate) entry: Vec<Action<C>>,
    pub(crate) exit: Vec<Action<C>>,
    /// Cached initial pseudostate child, for default region entry.
    pub(crate) initial: Option<StateId>,
    /// Cached history pseudostate children (at most one shallow + one deep).
    pub(crate) histories: SmallVec<[StateId; 2]>,
    /// Outgoing transitions in declaration order.
    pub(crate) transitions: SmallVec<[TransitionId; 4]>,
}

pub(crate) struct TransitionNode<C> {
    pub(crate) source: StateId,
    /// Equal to `source` for internal transitions.
    pub(crate) target: StateId,
    pub(crate) kind: TransitionKind,
    /// `None` marks a completion transition.
    pub(crate) trigger: Option<EventId>,
    pub(crate) guard: Option<Guard<C>>,
    pub(crate) actions: Vec<Action<C>>,
    pub(crate) label: Arc<str>,
    /// True for the auto-generated completion transition of an initial
    /// pseudostate. Synthetic transitions never reach observer hooks.
    pub(crate) synthetic: bool,
}

/// The immutable statechart: validated tables shared by every machine
/// instance built from it.
pub struct Chart<C> {
    name: Arc<str>,
    states: Vec<StateNode<C>>,
    transitions: Vec<TransitionNode<C>>,
    events: Vec<Arc<str>>,
    state_ids: HashMap<Arc<str>, StateId>,
    event_ids: HashMap<Arc<str>, EventId>,
}

impl<C> Chart<C> {
    /// Synthetic root. Never handed out; top-level states are its children.
    pub(crate) const ROOT: StateId = StateId(0);

    /// Start a new builder. Alias for [`ChartBuilder::new`].
    pub fn builder(name: &str) -> ChartBuilder<C> {
        ChartBuilder::new(name)
    }

    /// The chart's name, used as the default machine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a state by its declared name.
    pub fn state_id(&self, name: &str) -> Option<StateId> {
        self.state_ids.get(name).copied()
    }

    /// Look up an event by its declared name.
    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.event_ids.get(name).copied()
    }

    /// Declared name of a state.
    pub fn state_name(&self, state: StateId) -> &str {
        &self.states[state.0 as usize].name
    }

    /// Declared name of an event.
    pub fn event_name(&self, event: EventId) -> &str {
        &self.events[event.0 as usize]
    }

    /// Public classification of a state.
    pub fn kind(&self, state: StateId) -> StateKind {
        let node = self.node(state);
        match node.role {
            Role::Plain if self.has_region(state) => StateKind::Composite,
            Role::Plain => StateKind::Simple,
            Role::Final => StateKind::Final,
            Role::Initial => StateKind::Initial,
            Role::ShallowHistory => StateKind::ShallowHistory,
            Role::DeepHistory => StateKind::DeepHistory,
        }
    }

    /// Parent state, `None` for top-level states.
    pub fn parent(&self, state: StateId) -> Option<StateId> {
        match self.node(state).parent {
            Some(p) if p != Self::ROOT => Some(p),
            _ => None,
        }
    }

    /// All real (non-pseudo) states, in declaration order.
    pub fn states(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states
            .iter()
            .enumerate()
            .skip(1) // root
            .filter(|(_, node)| node.role.is_real())
            .map(|(idx, _)| StateId(idx as u32))
    }

    /// All declared events, in declaration order.
    pub fn events(&self) -> impl Iterator<Item = EventId> + '_ {
        (0..self.events.len()).map(|idx| EventId(idx as u32))
    }

    /// True if `descendant` sits strictly below `ancestor` in the state
    /// tree. A state is not its own descendant.
    pub fn is_descendant_of(&self, descendant: StateId, ancestor: StateId) -> bool {
        let mut cur = descendant;
        while let Some(parent) = self.node(cur).parent {
            if parent == ancestor {
                return true;
            }
            cur = parent;
        }
        false
    }

    // -------------------------------------------------------------------------
    // Crate-internal queries used by the step interpreter
    // -------------------------------------------------------------------------

    pub(crate) fn node(&self, state: StateId) -> &StateNode<C> {
        &self.states[state.0 as usize]
    }

    pub(crate) fn transition(&self, id: TransitionId) -> &TransitionNode<C> {
        &self.transitions[id.0 as usize]
    }

    pub(crate) fn depth(&self, state: StateId) -> u16 {
        self.node(state).depth
    }

    /// Parent including the synthetic root (callers must not pass ROOT).
    pub(crate) fn parent_raw(&self, state: StateId) -> StateId {
        self.node(state).parent.unwrap_or(Self::ROOT)
    }

    /// True if `state` has at least one real child (i.e., owns a region).
    pub(crate) fn has_region(&self, state: StateId) -> bool {
        self.node(state)
            .children
            .iter()
            .any(|&c| self.node(c).role.is_real())
    }

    pub(crate) fn event_label(&self, event: EventId) -> Arc<str> {
        self.events[event.0 as usize].clone()
    }

    pub(crate) fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Deepest state that is an ancestor-or-self of both arguments.
    /// Falls back to ROOT when the arguments share nothing else.
    pub(crate) fn lca(&self, a: StateId, b: StateId) -> StateId {
        let mut a = a;
        let mut b = b;
        while self.depth(a) > self.depth(b) {
            a = self.parent_raw(a);
        }
        while self.depth(b) > self.depth(a) {
            b = self.parent_raw(b);
        }
        while a != b {
            a = self.parent_raw(a);
            b = self.parent_raw(b);
        }
        a
    }

}

impl<C> fmt::Debug for Chart<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chart")
            .field("name", &self.name)
            .field("states", &(self.states.len() - 1))
            .field("transitions", &self.transitions.len())
            .field("events", &self.events.len())
            .finish()
    }
}

// =============================================================================
// Builder Drafts
// =============================================================================

struct StateDraft<C> {
    name: Arc<str>,
    parent: Option<StateId>,
    role: Role,
    entry: Vec<Action<C>>,
    exit: Vec<Action<C>>,
}

impl<C> Clone for StateDraft<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            parent: self.parent,
            role: self.role,
            entry: self.entry.clone(),
            exit: self.exit.clone(),
        }
    }
}

struct TransitionDraft<C> {
    source: Option<StateId>,
    target: Option<StateId>,
    kind: TransitionKind,
    trigger: Option<EventId>,
    guard: Option<Guard<C>>,
    actions: Vec<Action<C>>,
    synthetic: bool,
}

impl<C> TransitionDraft<C> {
    fn new(kind: TransitionKind) -> Self {
        Self {
            source: None,
            target: None,
            kind,
            trigger: None,
            guard: None,
            actions: Vec::new(),
            synthetic: false,
        }
    }
}

impl<C> Clone for TransitionDraft<C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            target: self.target,
            kind: self.kind,
            trigger: self.trigger,
            guard: self.guard.clone(),
            actions: self.actions.clone(),
            synthetic: self.synthetic,
        }
    }
}

// =============================================================================
// Chart Builder
// =============================================================================

/// Accumulates states, events, and transitions, then validates the whole
/// table in [`build`](ChartBuilder::build).
///
/// Cloneable: clone a fully-declared base, layer extra transitions onto
/// the clone, and build both. This is the composition answer to "machine
/// variants" (no subclassing anywhere).
pub struct ChartBuilder<C> {
    name: Arc<str>,
    states: Vec<StateDraft<C>>,
    transitions: Vec<TransitionDraft<C>>,
    events: Vec<Arc<str>>,
    /// Defects recorded by builder methods that cannot return errors
    /// (foreign ids, mostly). Surfaced as the first build error.
    defects: Vec<ChartError>,
}

impl<C> Clone for ChartBuilder<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            states: self.states.clone(),
            transitions: self.transitions.clone(),
            events: self.events.clone(),
            defects: self.defects.clone(),
        }
    }
}

impl<C> ChartBuilder<C> {
    pub fn new(name: &str) -> Self {
        let root = StateDraft {
            name: Arc::from("<root>"),
            parent: None,
            role: Role::Plain,
            entry: Vec::new(),
            exit: Vec::new(),
        };
        Self {
            name: Arc::from(name),
            states: vec![root],
            transitions: Vec::new(),
            events: Vec::new(),
            defects: Vec::new(),
        }
    }

    /// Declare an event. Names are unique per chart.
    pub fn event(&mut self, name: &str) -> EventId {
        let id = EventId(self.events.len() as u32);
        self.events.push(Arc::from(name));
        id
    }

    /// Declare a top-level state.
    pub fn state(&mut self, name: &str) -> StateId {
        self.push_state(name, Chart::<C>::ROOT, Role::Plain)
    }

    /// Declare a child state, making `parent` composite.
    pub fn child(&mut self, parent: StateId, name: &str) -> StateId {
        self.push_state(name, parent, Role::Plain)
    }

    /// Declare a top-level final state.
    pub fn final_state(&mut self, name: &str) -> StateId {
        self.push_state(name, Chart::<C>::ROOT, Role::Final)
    }

    /// Declare a final state inside `parent`. When it becomes active, the
    /// parent's region is complete and the parent's completion
    /// transitions become enabled.
    pub fn final_child(&mut self, parent: StateId, name: &str) -> StateId {
        self.push_state(name, parent, Role::Final)
    }

    /// Declare the initial pseudostate of `target`'s region.
    ///
    /// `target` must be a plain state; its parent's region (or the chart
    /// root, for top-level states) gets `target` as default entry. Every
    /// region needs exactly one of these.
    pub fn initial(&mut self, target: StateId) -> StateId {
        let parent = match self.checked(target) {
            Some(draft) => draft.parent.unwrap_or(Chart::<C>::ROOT),
            None => Chart::<C>::ROOT,
        };
        let region_name = self.states[parent.0 as usize].name.clone();
        let id = self.push_state(&format!("<initial:{region_name}>"), parent, Role::Initial);

        let mut draft = TransitionDraft::new(TransitionKind::External);
        draft.source = Some(id);
        draft.target = Some(target);
        draft.synthetic = true;
        self.transitions.push(draft);
        id
    }

    /// Declare a shallow history pseudostate in `parent`: remembers the
    /// immediate child that was active when `parent` last exited.
    pub fn shallow_history(&mut self, parent: StateId) -> StateId {
        let name = self.pseudo_name("history", parent);
        self.push_state(&name, parent, Role::ShallowHistory)
    }

    /// Declare a deep history pseudostate in `parent`: remembers the full
    /// active sub-tree (down to the leaf) when `parent` last exited.
    pub fn deep_history(&mut self, parent: StateId) -> StateId {
        let name = self.pseudo_name("deep-history", parent);
        self.push_state(&name, parent, Role::DeepHistory)
    }

    /// Append an entry action to a state. Entry actions run in
    /// registration order each time the state is entered.
    pub fn on_entry(
        &mut self,
        state: StateId,
        action: impl Fn(&mut C, &StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        if self.checked(state).is_some() {
            self.states[state.0 as usize].entry.push(Arc::new(action));
        }
        self
    }

    /// Append an exit action to a state. Exit actions run in registration
    /// order each time the state is exited.
    pub fn on_exit(
        &mut self,
        state: StateId,
        action: impl Fn(&mut C, &StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        if self.checked(state).is_some() {
            self.states[state.0 as usize].exit.push(Arc::new(action));
        }
        self
    }

    /// Start an external transition: `.from(a).to(b).on(e)` plus optional
    /// `.when(guard)` and `.run(action)`s, finished with `.done()`.
    /// Omitting `.on(..)` declares a completion transition.
    pub fn external(&mut self) -> TransitionBuilder<'_, C> {
        TransitionBuilder {
            builder: self,
            draft: TransitionDraft::new(TransitionKind::External),
        }
    }

    /// Start a local transition: like external, but the source composite
    /// itself is neither exited nor re-entered.
    pub fn local(&mut self) -> TransitionBuilder<'_, C> {
        TransitionBuilder {
            builder: self,
            draft: TransitionDraft::new(TransitionKind::Local),
        }
    }

    /// Start an internal transition: `.within(s).on(e)`, actions only, no
    /// state change.
    pub fn internal(&mut self) -> TransitionBuilder<'_, C> {
        TransitionBuilder {
            builder: self,
            draft: TransitionDraft::new(TransitionKind::Internal),
        }
    }

    fn push_state(&mut self, name: &str, parent: StateId, role: Role) -> StateId {
        if parent != Chart::<C>::ROOT && self.checked(parent).is_none() {
            // Defect already recorded; park the node under root so the
            // returned id stays in range.
            let id = StateId(self.states.len() as u32);
            self.states.push(StateDraft {
                name: Arc::from(name),
                parent: Some(Chart::<C>::ROOT),
                role,
                entry: Vec::new(),
                exit: Vec::new(),
            });
            return id;
        }
        let id = StateId(self.states.len() as u32);
        self.states.push(StateDraft {
            name: Arc::from(name),
            parent: Some(parent),
            role,
            entry: Vec::new(),
            exit: Vec::new(),
        });
        id
    }

    fn pseudo_name(&mut self, kind: &str, parent: StateId) -> String {
        match self.checked(parent) {
            Some(draft) => format!("<{kind}:{}>", draft.name),
            None => format!("<{kind}:?>"),
        }
    }

    /// Bounds-checked draft access; records a `ForeignId` defect on miss.
    fn checked(&mut self, state: StateId) -> Option<&StateDraft<C>> {
        if (state.0 as usize) < self.states.len() {
            self.states.get(state.0 as usize)
        } else {
            self.defects.push(ChartError::ForeignId { index: state.0 });
            None
        }
    }

    /// Validate the accumulated tables and produce the immutable chart.
    pub fn build(self) -> Result<Chart<C>, ChartError> {
        if let Some(defect) = self.defects.first() {
            return Err(defect.clone());
        }

        let state_count = self.states.len();
        let event_count = self.events.len();

        // ---- id bounds -----------------------------------------------------
        for draft in &self.transitions {
            for id in [draft.source, draft.target].into_iter().flatten() {
                if id.0 as usize >= state_count {
                    return Err(ChartError::ForeignId { index: id.0 });
                }
            }
            if let Some(ev) = draft.trigger {
                if ev.0 as usize >= event_count {
                    return Err(ChartError::ForeignId { index: ev.0 });
                }
            }
        }

        // ---- unique names --------------------------------------------------
        // Pseudostates carry generated names and are exempt; two initials
        // in one region must surface as DuplicateInitial, not as a name
        // clash of their generated labels.
        let mut state_ids: HashMap<Arc<str>, StateId> = HashMap::new();
        for (idx, draft) in self.states.iter().enumerate().skip(1) {
            if draft.role.is_pseudo() {
                continue;
            }
            if state_ids
                .insert(draft.name.clone(), StateId(idx as u32))
                .is_some()
            {
                return Err(ChartError::DuplicateState {
                    name: draft.name.to_string(),
                });
            }
        }
        let mut event_ids: HashMap<Arc<str>, EventId> = HashMap::new();
        for (idx, name) in self.events.iter().enumerate() {
            if event_ids.insert(name.clone(), EventId(idx as u32)).is_some() {
                return Err(ChartError::DuplicateEvent {
                    name: name.to_string(),
                });
            }
        }

        // ---- assemble nodes ------------------------------------------------
        let mut states: Vec<StateNode<C>> = self
            .states
            .into_iter()
            .map(|draft| StateNode {
                name: draft.name,
                parent: draft.parent,
                role: draft.role,
                depth: 0,
                children: SmallVec::new(),
                entry: draft.entry,
                exit: draft.exit,
                initial: None,
                histories: SmallVec::new(),
                transitions: SmallVec::new(),
            })
            .collect();

        // Parents are always declared before children, so one forward pass
        // settles depth and child lists.
        for idx in 1..states.len() {
            let parent = states[idx].parent.unwrap_or(Chart::<C>::ROOT);
            states[idx].depth = states[parent.0 as usize].depth + 1;
            states[parent.0 as usize].children.push(StateId(idx as u32));
        }

        if states[0].children.is_empty() {
            return Err(ChartError::EmptyChart {
                chart: self.name.to_string(),
            });
        }

        // ---- region shape --------------------------------------------------
        for idx in 0..states.len() {
            let node = &states[idx];
            if node.role.is_pseudo() {
                continue;
            }
            let children: Vec<StateId> = node.children.to_vec();
            if children.is_empty() {
                continue;
            }

            let has_real = children.iter().any(|&c| states[c.0 as usize].role.is_real());
            let mut initial = None;
            let mut shallow = 0usize;
            let mut deep = 0usize;
            for &c in &children {
                match states[c.0 as usize].role {
                    Role::Initial => {
                        if initial.replace(c).is_some() {
                            return Err(ChartError::DuplicateInitial {
                                state: states[idx].name.to_string(),
                            });
                        }
                    }
                    Role::ShallowHistory => shallow += 1,
                    Role::DeepHistory => deep += 1,
                    _ => {}
                }
            }

            if !has_real {
                // Only pseudostate children: history without a region.
                return Err(ChartError::HistoryWithoutRegion {
                    state: states[idx].name.to_string(),
                });
            }
            if initial.is_none() {
                return Err(ChartError::MissingInitial {
                    state: states[idx].name.to_string(),
                });
            }
            if shallow > 1 {
                return Err(ChartError::DuplicateHistory {
                    state: states[idx].name.to_string(),
                    kind: "shallow",
                });
            }
            if deep > 1 {
                return Err(ChartError::DuplicateHistory {
                    state: states[idx].name.to_string(),
                    kind: "deep",
                });
            }

            states[idx].initial = initial;
            let histories: SmallVec<[StateId; 2]> = children
                .iter()
                .copied()
                .filter(|&c| {
                    matches!(
                        states[c.0 as usize].role,
                        Role::ShallowHistory | Role::DeepHistory
                    )
                })
                .collect();
            states[idx].histories = histories;
        }

        // Final states and pseudostates carry no regions and no actions.
        for node in states.iter().skip(1) {
            if node.role.is_pseudo() && (!node.entry.is_empty() || !node.exit.is_empty()) {
                return Err(ChartError::ActionsOnPseudostate {
                    state: node.name.to_string(),
                });
            }
        }

        // ---- transitions ---------------------------------------------------
        let mut transitions: Vec<TransitionNode<C>> = Vec::with_capacity(self.transitions.len());
        for (index, draft) in self.transitions.into_iter().enumerate() {
            let source = draft
                .source
                .ok_or(ChartError::TransitionWithoutSource { index })?;
            let target = draft
                .target
                .ok_or(ChartError::TransitionWithoutTarget { index })?;

            let source_node = &states[source.0 as usize];
            let target_node = &states[target.0 as usize];
            let label: Arc<str> = match (draft.kind, draft.trigger) {
                (TransitionKind::Internal, Some(ev)) => Arc::from(format!(
                    "{} internal on {}",
                    source_node.name, self.events[ev.0 as usize]
                )),
                (TransitionKind::Internal, None) => {
                    Arc::from(format!("{} internal completion", source_node.name))
                }
                (_, Some(ev)) => Arc::from(format!(
                    "{} -> {} on {}",
                    source_node.name, target_node.name, self.events[ev.0 as usize]
                )),
                (_, None) => Arc::from(format!("{} -> {}", source_node.name, target_node.name)),
            };

            if !draft.synthetic {
                match source_node.role {
                    Role::Plain => {}
                    Role::Final => {
                        return Err(ChartError::TransitionFromFinal {
                            state: source_node.name.to_string(),
                        })
                    }
                    _ => {
                        return Err(ChartError::TransitionFromPseudostate {
                            state: source_node.name.to_string(),
                        })
                    }
                }
            }

            if target_node.role == Role::Initial && !draft.synthetic {
                return Err(ChartError::TransitionToInitial {
                    label: label.to_string(),
                });
            }

            match draft.kind {
                TransitionKind::Internal => {
                    if target != source {
                        return Err(ChartError::InternalWithTarget {
                            state: source_node.name.to_string(),
                        });
                    }
                    if draft.trigger.is_none() {
                        return Err(ChartError::InternalCompletion {
                            state: source_node.name.to_string(),
                        });
                    }
                }
                TransitionKind::Local => {
                    let descends = {
                        let mut cur = target;
                        let mut found = false;
                        while let Some(p) = states[cur.0 as usize].parent {
                            if p == source {
                                found = true;
                                break;
                            }
                            cur = p;
                        }
                        found
                    };
                    if !descends {
                        return Err(ChartError::LocalOutsideSource {
                            label: label.to_string(),
                        });
                    }
                }
                TransitionKind::External => {}
            }

            transitions.push(TransitionNode {
                source,
                target,
                kind: draft.kind,
                trigger: draft.trigger,
                guard: draft.guard,
                actions: draft.actions,
                label,
                synthetic: draft.synthetic,
            });
        }

        // Initial pseudostates: exactly one synthetic completion each,
        // targeting a plain direct sibling.
        for (idx, node) in states.iter().enumerate() {
            if node.role != Role::Initial {
                continue;
            }
            let outgoing: Vec<usize> = transitions
                .iter()
                .enumerate()
                .filter(|(_, t)| t.source == StateId(idx as u32))
                .map(|(i, _)| i)
                .collect();
            // By construction there is exactly one; defensive check only.
            let Some(&tidx) = outgoing.first() else {
                return Err(ChartError::MissingInitial {
                    state: states[node.parent.unwrap_or(Chart::<C>::ROOT).0 as usize]
                        .name
                        .to_string(),
                });
            };
            let target = transitions[tidx].target;
            let target_node = &states[target.0 as usize];
            let region = node.parent.unwrap_or(Chart::<C>::ROOT);
            if target_node.role != Role::Plain || target_node.parent != Some(region) {
                return Err(ChartError::InvalidInitialTarget {
                    region: states[region.0 as usize].name.to_string(),
                    target: target_node.name.to_string(),
                });
            }
        }

        // Outgoing lists, declaration order.
        for (idx, t) in transitions.iter().enumerate() {
            states[t.source.0 as usize]
                .transitions
                .push(TransitionId(idx as u32));
        }

        Ok(Chart {
            name: self.name,
            states,
            transitions,
            events: self.events,
            state_ids,
            event_ids,
        })
    }
}

impl<C> fmt::Debug for ChartBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChartBuilder")
            .field("name", &self.name)
            .field("states", &(self.states.len() - 1))
            .field("transitions", &self.transitions.len())
            .field("events", &self.events.len())
            .finish()
    }
}

// =============================================================================
// Transition Builder
// =============================================================================

/// Fluent declaration of one transition, finished with
/// [`done`](TransitionBuilder::done).
pub struct TransitionBuilder<'b, C> {
    builder: &'b mut ChartBuilder<C>,
    draft: TransitionDraft<C>,
}

impl<'b, C> TransitionBuilder<'b, C> {
    /// Source state (external and local transitions).
    pub fn from(mut self, source: StateId) -> Self {
        self.draft.source = Some(source);
        self
    }

    /// Source-and-target of an internal transition.
    pub fn within(mut self, state: StateId) -> Self {
        self.draft.source = Some(state);
        self.draft.target = Some(state);
        self
    }

    /// Target state. May be a real state or a history pseudostate.
    pub fn to(mut self, target: StateId) -> Self {
        self.draft.target = Some(target);
        self
    }

    /// Triggering event. Omit entirely to declare a completion transition.
    pub fn on(mut self, event: EventId) -> Self {
        self.draft.trigger = Some(event);
        self
    }

    /// Guard predicate; the transition only fires when it returns true.
    pub fn when(mut self, guard: impl Fn(&C, &Trigger) -> bool + Send + Sync + 'static) -> Self {
        self.draft.guard = Some(Arc::new(guard));
        self
    }

    /// Append an action. Actions run in declaration order after the exit
    /// phase and before the entry phase.
    pub fn run(
        mut self,
        action: impl Fn(&mut C, &StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.draft.actions.push(Arc::new(action));
        self
    }

    /// Record the transition. Structural validation happens in
    /// `ChartBuilder::build`.
    pub fn done(self) -> TransitionId {
        let id = TransitionId(self.builder.transitions.len() as u32);
        self.builder.transitions.push(self.draft);
        id
    }
}
