//! Fault packaging and routing for callback failures.
//!
//! Any callback the runtime invokes during a step (guard, transition
//! action, entry action, exit action, observer hook) may fail by
//! returning an error or by panicking. The worker catches the failure at
//! the call site, packages it with its originating context as a [`Fault`],
//! and forwards it synchronously to a [`FaultRouter`]: an ordered chain of
//! handlers installed by the application.
//!
//! # Key Invariants
//!
//! - **The worker survives.** No callback failure terminates a machine's
//!   worker; the step continues with its next independent concern and the
//!   machine proceeds to the next queued event.
//! - **Handlers cannot make it worse.** Each handler runs isolated; a
//!   panicking handler is logged and the rest of the chain still runs.
//! - **No silent loss.** A router with no handlers logs every fault at
//!   error level.
//!
//! The router is an explicitly constructed, injected service: share one
//! clone across every machine for a process-wide handler chain, or give a
//! machine its own for per-machine handling.
//!
//! # Example
//!
//! ```ignore
//! let faults = FaultRouter::new();
//! faults.on_fault(|fault| {
//!     eprintln!("[{}] {} in {:?}: {}", fault.at, fault.kind, fault.state, fault.error);
//! });
//!
//! let machine = Machine::builder(chart, ctx)
//!     .with_fault_router(&faults)
//!     .build();
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::machine::MachineId;

// =============================================================================
// Fault
// =============================================================================

/// Which callback surface failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A transition guard panicked while being evaluated. The transition
    /// was skipped and resolution continued as if the guard returned false.
    Guard,
    /// A transition's action list failed; its remaining actions were
    /// skipped, the structural exit/entry sequence still completed.
    TransitionAction,
    /// A state's entry-action list failed; the state still counts as
    /// entered.
    Entry,
    /// A state's exit-action list failed; the state still counts as
    /// exited.
    Exit,
    /// An observer hook panicked. Observation never alters semantics, so
    /// the step is unaffected.
    Observer,
    /// A completion-transition chain exceeded the per-step limit and was
    /// cut off (almost always a cycle of completion transitions).
    CompletionLimit,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Guard => "guard",
            FaultKind::TransitionAction => "transition_action",
            FaultKind::Entry => "entry",
            FaultKind::Exit => "exit",
            FaultKind::Observer => "observer",
            FaultKind::CompletionLimit => "completion_limit",
        };
        write!(f, "{s}")
    }
}

/// A callback failure, packaged with where it happened.
///
/// Passed by reference to each handler in the router's chain; handlers
/// needing to keep it call [`Fault::summary`] for an owned, serializable
/// form.
#[derive(Debug)]
pub struct Fault {
    /// Instance that was executing the step.
    pub machine: MachineId,
    /// Instance name (defaults to the chart name).
    pub machine_name: Arc<str>,
    /// State whose callback failed, when the failure has one.
    pub state: Option<Arc<str>>,
    /// Transition being executed, when the failure has one.
    pub transition: Option<Arc<str>>,
    /// Which callback surface failed.
    pub kind: FaultKind,
    /// The underlying error: an action's returned error, or a captured
    /// panic message.
    pub error: anyhow::Error,
    /// Wall-clock capture time.
    pub at: DateTime<Utc>,
}

impl Fault {
    /// Owned, serializable snapshot of this fault.
    pub fn summary(&self) -> FaultSummary {
        FaultSummary {
            machine: self.machine,
            machine_name: self.machine_name.to_string(),
            state: self.state.as_deref().map(str::to_string),
            transition: self.transition.as_deref().map(str::to_string),
            kind: self.kind,
            error: format!("{:#}", self.error),
            at: self.at,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault in machine '{}'", self.kind, self.machine_name)?;
        if let Some(state) = &self.state {
            write!(f, " at state '{state}'")?;
        }
        if let Some(transition) = &self.transition {
            write!(f, " during '{transition}'")?;
        }
        write!(f, ": {:#}", self.error)
    }
}

/// Owned form of a [`Fault`] for logging pipelines and assertions.
#[derive(Debug, Clone, Serialize)]
pub struct FaultSummary {
    pub machine: MachineId,
    pub machine_name: String,
    pub state: Option<String>,
    pub transition: Option<String>,
    pub kind: FaultKind,
    pub error: String,
    pub at: DateTime<Utc>,
}

// =============================================================================
// Fault Router
// =============================================================================

type FaultHandler = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Ordered chain of fault handlers, invoked synchronously inside the step.
///
/// Cloning shares the chain: register once, hand clones to every machine.
/// Registration is thread-safe and allowed at any time; handlers see only
/// faults raised after they were registered.
#[derive(Clone, Default)]
pub struct FaultRouter {
    inner: Arc<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    handlers: RwLock<Vec<FaultHandler>>,
}

impl FaultRouter {
    /// A router with no handlers. Faults are logged at error level until a
    /// handler is registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the chain.
    ///
    /// Handlers run in registration order. A handler that panics is logged
    /// and skipped; the rest of the chain still runs.
    pub fn on_fault(&self, handler: impl Fn(&Fault) + Send + Sync + 'static) -> &Self {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.push(Arc::new(handler));
        self
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one fault through the chain.
    ///
    /// Called by machine workers; applications normally have no reason to
    /// call this directly, but synthesizing faults in tests is fair game.
    pub fn route(&self, fault: Fault) {
        // Snapshot the chain so handlers run without holding the lock.
        let handlers: Vec<FaultHandler> = {
            let guard = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.clone()
        };

        if handlers.is_empty() {
            error!(
                machine = %fault.machine_name,
                kind = %fault.kind,
                state = fault.state.as_deref().unwrap_or("-"),
                transition = fault.transition.as_deref().unwrap_or("-"),
                error = %format!("{:#}", fault.error),
                "unhandled fault (no fault handlers registered)"
            );
            return;
        }

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&fault))).is_err() {
                error!(
                    machine = %fault.machine_name,
                    kind = %fault.kind,
                    "fault handler panicked; continuing with remaining handlers"
                );
            }
        }
    }
}

impl fmt::Debug for FaultRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultRouter")
            .field("handlers", &self.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Panic Extraction
// =============================================================================

/// Best-effort extraction of a panic payload into a printable message.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_fault(kind: FaultKind) -> Fault {
        Fault {
            machine: MachineId::new(),
            machine_name: Arc::from("test_machine"),
            state: Some(Arc::from("Broken")),
            transition: None,
            kind,
            error: anyhow::anyhow!("boom"),
            at: Utc::now(),
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let router = FaultRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        router.on_fault(move |_| o.lock().unwrap().push("first"));
        let o = order.clone();
        router.on_fault(move |_| o.lock().unwrap().push("second"));

        router.route(test_fault(FaultKind::Entry));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_chain() {
        let router = FaultRouter::new();
        let reached = Arc::new(AtomicUsize::new(0));

        router.on_fault(|_| panic!("handler blew up"));
        let r = reached.clone();
        router.on_fault(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        router.route(test_fault(FaultKind::Guard));

        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_router_only_logs() {
        // Nothing to assert beyond "does not panic".
        FaultRouter::new().route(test_fault(FaultKind::Exit));
    }

    #[test]
    fn summary_is_owned_and_serializable() {
        let fault = test_fault(FaultKind::TransitionAction);
        let summary = fault.summary();

        assert_eq!(summary.machine_name, "test_machine");
        assert_eq!(summary.state.as_deref(), Some("Broken"));
        assert_eq!(summary.kind, FaultKind::TransitionAction);
        assert!(summary.error.contains("boom"));

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("transition_action"));
    }

    #[test]
    fn display_names_the_site() {
        let fault = test_fault(FaultKind::Entry);
        let text = fault.to_string();
        assert!(text.contains("entry fault"));
        assert!(text.contains("test_machine"));
        assert!(text.contains("Broken"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn panic_message_handles_both_payload_shapes() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(boxed), "non-string panic payload");
    }
}
