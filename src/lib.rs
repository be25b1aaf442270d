//! # Ratchet
//!
//! A concurrent, run-to-completion statechart runtime where hierarchy
//! defines structure, events drive steps, and every step settles before
//! the next begins.
//!
//! ## Core Concepts
//!
//! Ratchet separates **shape** from **instance**:
//! - [`Chart`] = Shape (states, events, transitions; immutable, shared)
//! - [`Machine`] = Instance (one context, one worker, one mailbox)
//!
//! The key principle: **One Machine = One Worker = One Step at a Time**.
//! Concurrency lives between machines; inside a machine, steps are
//! strictly sequential and each runs to completion.
//!
//! ## Architecture
//!
//! ```text
//! Producers (other machines, timers, outside threads)
//!     │
//!     ▼ post()
//! Mailbox (FIFO per producer, exactly-once)
//!     │
//!     ▼ recv()                         TimerService
//! Worker task ◀─────deadline events────────┘
//!     │
//!     ├─► resolve   leaf-first, internal → local → external
//!     ├─► exit      leaf-first, history recorded before exit actions
//!     ├─► actions   in declaration order
//!     ├─► entry     top-down, defaults or history to a leaf
//!     └─► complete  drain completion transitions, then publish
//!                        │
//!           observer hooks ──► entered / exited / fired
//!           fault router ────► guard, action, observer failures
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Steps are atomic** - Between steps the active configuration is a
//!    full root-to-leaf path, never a partial one
//! 2. **Charts are tables** - Variants come from layering transitions on
//!    a cloned [`ChartBuilder`], never from subclassing
//! 3. **Deeper states win** - A child's transition beats its ancestor's
//!    for the same event
//! 4. **Callbacks cannot kill the worker** - Errors and panics become
//!    routed [`Fault`]s; the step completes structurally
//! 5. **Unmatched events vanish quietly** - Discarding is normal
//!    operation, logged at debug level
//!
//! ## Guarantees
//!
//! - The initial configuration settles before the first posted event is
//!   processed
//! - Events from one producer are processed in posting order, each
//!   exactly once
//! - `stop().await` returns only after the worker has exited; queued
//!   leftovers are dropped
//! - Timers fire through the mailbox like any other producer; cancelling
//!   a fired timer is a no-op
//!
//! ## Example
//!
//! ```ignore
//! use ratchet::{ChartBuilder, Machine, TimerService};
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct Ctx {
//!     attempts: u32,
//! }
//!
//! let mut b = ChartBuilder::<Ctx>::new("command_processor");
//! let command = b.event("Command");
//! let response = b.event("Response");
//! let timeout = b.event("ResponseTimeout");
//!
//! let waiting = b.state("WaitForCommand");
//! let pending = b.state("WaitForResponse");
//! b.initial(waiting);
//!
//! b.on_entry(pending, move |_, ctx| {
//!     ctx.schedule(timeout, Duration::from_millis(250))?;
//!     Ok(())
//! });
//! b.on_exit(pending, move |_, ctx| {
//!     ctx.cancel(timeout)?;
//!     Ok(())
//! });
//!
//! b.external().from(waiting).to(pending).on(command).done();
//! b.external()
//!     .from(pending)
//!     .to(waiting)
//!     .on(response)
//!     .run(|c: &mut Ctx, _| {
//!         c.attempts = 0;
//!         Ok(())
//!     })
//!     .done();
//!
//! let chart = b.build()?;
//! let timer = TimerService::new();
//! let machine = Machine::builder(chart, Ctx::default())
//!     .with_timer(&timer)
//!     .build();
//!
//! machine.start();
//! machine.post(command)?;
//! // ... later
//! machine.stop().await;
//! ```
//!
//! ## What This Is Not
//!
//! Ratchet is **not**:
//! - An actor framework (machines do not address each other by name)
//! - A workflow/saga engine (no persistence, no replay)
//! - A parser of statechart interchange formats
//! - A visualization tool
//!
//! Ratchet **is**:
//! > A concurrent, run-to-completion statechart runtime where hierarchy
//! > defines structure, events drive steps, and every step settles before
//! > the next begins.

// Core modules
mod chart;
mod error;
mod fault;
mod machine;
mod mailbox;
mod observe;
mod step;
mod timer;

// Testing utilities (in-crate tests and the `testing` feature)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export the chart model
pub use crate::chart::{
    Action, Chart, ChartBuilder, EventId, Guard, StateId, StateKind, TransitionBuilder,
    TransitionId, TransitionKind,
};

// Re-export machines and their surroundings
pub use crate::machine::{Lifecycle, Machine, MachineBuilder, MachineId};
pub use crate::mailbox::{Mailbox, Payload};
pub use crate::step::{StepContext, Trigger};
pub use crate::timer::TimerService;

// Re-export observability and fault routing
pub use crate::fault::{Fault, FaultKind, FaultRouter, FaultSummary};
pub use crate::observe::{EnterCtx, ExitCtx, HookId, TransitionCtx};

// Re-export error types
pub use crate::error::{ChartError, RatchetError};
