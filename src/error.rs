//! Error types for chart assembly and runtime operations.
//!
//! Two surfaces, two enums:
//!
//! - [`ChartError`]: structural problems caught when a [`ChartBuilder`]
//!   validates its tables in `build()`. These never occur at runtime; a
//!   chart that builds is structurally sound.
//! - [`RatchetError`]: runtime operations that can be refused (posting to
//!   a machine that is not running, a full bounded mailbox, scheduling
//!   without an attached timer).
//!
//! Callback failures are deliberately NOT here: a guard or action that
//! fails mid-step is routed through [`FaultRouter`](crate::FaultRouter) as
//! a [`Fault`](crate::Fault), never returned from an API call.
//!
//! [`ChartBuilder`]: crate::ChartBuilder

use thiserror::Error;

// =============================================================================
// Chart Assembly Errors
// =============================================================================

/// Structural validation failures reported by `ChartBuilder::build`.
///
/// Every variant names the offending state, event, or transition so the
/// assembly site can be fixed without spelunking. Validation runs over the
/// whole table; the first problem found is returned.
#[derive(Debug, Clone, Error)]
pub enum ChartError {
    /// Two states declared with the same name.
    #[error("duplicate state name '{name}'")]
    DuplicateState { name: String },

    /// Two events declared with the same name.
    #[error("duplicate event name '{name}'")]
    DuplicateEvent { name: String },

    /// The chart has no top-level states at all.
    #[error("chart '{chart}' declares no states")]
    EmptyChart { chart: String },

    /// A composite state (or the chart root) lacks an initial pseudostate,
    /// so there is no default entry for its region.
    #[error("'{state}' has child states but no initial pseudostate")]
    MissingInitial { state: String },

    /// More than one initial pseudostate in the same region.
    #[error("'{state}' declares more than one initial pseudostate")]
    DuplicateInitial { state: String },

    /// An initial pseudostate must target a plain direct child of its
    /// region, not a pseudostate or final state outside it.
    #[error("initial pseudostate of '{region}' must target a plain child state, got '{target}'")]
    InvalidInitialTarget { region: String, target: String },

    /// History pseudostates only make sense inside a composite state.
    #[error("'{state}' has no child region; history pseudostates require a composite parent")]
    HistoryWithoutRegion { state: String },

    /// At most one shallow and one deep history pseudostate per composite.
    #[error("'{state}' declares more than one {kind} history pseudostate")]
    DuplicateHistory { state: String, kind: &'static str },

    /// Entry/exit actions are only meaningful on real states.
    #[error("entry/exit actions are not allowed on pseudostate '{state}'")]
    ActionsOnPseudostate { state: String },

    /// A transition was finalized without `.from(..)` / `.within(..)`.
    #[error("transition #{index} has no source state")]
    TransitionWithoutSource { index: usize },

    /// A transition was finalized without `.to(..)`.
    #[error("transition #{index} has no target state")]
    TransitionWithoutTarget { index: usize },

    /// Initial and history pseudostates cannot be transition sources.
    #[error("transitions cannot originate from pseudostate '{state}'")]
    TransitionFromPseudostate { state: String },

    /// Final states react to nothing; completion propagates to the
    /// enclosing region instead.
    #[error("final state '{state}' cannot have outgoing transitions")]
    TransitionFromFinal { state: String },

    /// Initial pseudostates are entry machinery, never a destination.
    #[error("transition '{label}' targets an initial pseudostate")]
    TransitionToInitial { label: String },

    /// Local transitions stay inside their source: the source must be a
    /// composite state and the target a proper descendant of it.
    #[error("local transition '{label}' requires a composite source containing its target")]
    LocalOutsideSource { label: String },

    /// Internal transitions never change state; a differing target is a
    /// contradiction (use a local or external transition instead).
    #[error("internal transition on '{state}' cannot carry a target")]
    InternalWithTarget { state: String },

    /// An internal completion transition would be enabled again the moment
    /// it ran, looping forever.
    #[error("completion transition on '{state}' cannot be internal")]
    InternalCompletion { state: String },

    /// An id handed out by a different builder was used with this one.
    #[error("id #{index} does not belong to this chart")]
    ForeignId { index: u32 },
}

// =============================================================================
// Runtime Errors
// =============================================================================

/// Refused runtime operations.
///
/// These are returned to the caller of the refusing API; they never
/// terminate a worker and never travel through fault routing.
#[derive(Debug, Error)]
pub enum RatchetError {
    /// The target machine is not in the running state (never started,
    /// stopping, or stopped). Posting into it is refused, including for
    /// timer-fired events.
    #[error("machine '{machine}' is not running")]
    NotRunning { machine: String },

    /// A bounded mailbox is at capacity. The overflow policy is reject:
    /// the new event is refused and nothing already queued is dropped.
    #[error("mailbox of machine '{machine}' is full (capacity {capacity})")]
    MailboxFull { machine: String, capacity: usize },

    /// `StepContext::schedule`/`cancel` was called on a machine built
    /// without `with_timer`.
    #[error("machine '{machine}' has no timer service attached")]
    TimerUnavailable { machine: String },

    /// The timer service's clock task has shut down; nothing further can
    /// be scheduled through this handle.
    #[error("timer service has shut down")]
    TimerStopped,
}
