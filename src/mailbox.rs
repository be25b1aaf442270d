//! Machine mailboxes: the only way events reach a machine.
//!
//! Every machine owns exactly one mailbox. Any number of producers
//! (other machines' actions, timers, outside tasks) hold cloned
//! [`Mailbox`] handles and post concurrently; the machine's worker drains
//! the other end one envelope at a time. FIFO order is preserved per
//! producer, and each envelope is consumed by exactly one step.
//!
//! Mailboxes are unbounded by default. A machine built with an explicit
//! capacity switches to a bounded channel that rejects overflow with
//! [`RatchetError::MailboxFull`] instead of silently dropping events.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::chart::EventId;
use crate::error::RatchetError;
use crate::machine::{MachineId, MachineShared};

/// Opaque event payload, shared by reference and downcast at the
/// receiving end via [`Trigger::payload`](crate::step::Trigger::payload).
pub type Payload = Arc<dyn Any + Send + Sync>;

/// One posted event on its way to a machine.
#[derive(Clone)]
pub(crate) struct Envelope {
    pub(crate) event: EventId,
    pub(crate) payload: Option<Payload>,
}

enum Tx {
    Unbounded(mpsc::UnboundedSender<Envelope>),
    Bounded(mpsc::Sender<Envelope>),
}

impl Clone for Tx {
    fn clone(&self) -> Self {
        match self {
            Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
            Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
        }
    }
}

/// Cloneable posting handle for one machine's event queue.
///
/// Posting never blocks: unbounded mailboxes always accept while the
/// machine runs, bounded mailboxes reject with
/// [`RatchetError::MailboxFull`] when at capacity. Posting to a machine
/// that is not running fails with [`RatchetError::NotRunning`].
#[derive(Clone)]
pub struct Mailbox {
    shared: Arc<MachineShared>,
    tx: Tx,
}

impl Mailbox {
    /// Post an event with no payload.
    pub fn post(&self, event: EventId) -> Result<(), RatchetError> {
        self.post_envelope(Envelope {
            event,
            payload: None,
        })
    }

    /// Post an event carrying a payload.
    pub fn post_with(&self, event: EventId, payload: Payload) -> Result<(), RatchetError> {
        self.post_envelope(Envelope {
            event,
            payload: Some(payload),
        })
    }

    pub(crate) fn post_envelope(&self, envelope: Envelope) -> Result<(), RatchetError> {
        if !self.shared.is_running() {
            return Err(RatchetError::NotRunning {
                machine: self.shared.name.to_string(),
            });
        }
        match &self.tx {
            Tx::Unbounded(tx) => tx.send(envelope).map_err(|_| RatchetError::NotRunning {
                machine: self.shared.name.to_string(),
            }),
            Tx::Bounded(tx) => tx.try_send(envelope).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => RatchetError::MailboxFull {
                    machine: self.shared.name.to_string(),
                    capacity: tx.max_capacity(),
                },
                mpsc::error::TrySendError::Closed(_) => RatchetError::NotRunning {
                    machine: self.shared.name.to_string(),
                },
            }),
        }
    }

    /// Id of the machine this mailbox feeds.
    pub fn machine(&self) -> MachineId {
        self.shared.id
    }

    /// Name of the machine this mailbox feeds.
    pub fn machine_name(&self) -> &str {
        &self.shared.name
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("machine", &self.shared.id)
            .field("name", &self.shared.name)
            .field("bounded", &matches!(self.tx, Tx::Bounded(_)))
            .finish()
    }
}

/// Worker-side end of the queue.
pub(crate) enum MailboxReceiver {
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
    Bounded(mpsc::Receiver<Envelope>),
}

impl MailboxReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        match self {
            MailboxReceiver::Unbounded(rx) => rx.recv().await,
            MailboxReceiver::Bounded(rx) => rx.recv().await,
        }
    }

    /// Non-blocking receive, for tests that drive a stepper by hand.
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Envelope> {
        match self {
            MailboxReceiver::Unbounded(rx) => rx.try_recv().ok(),
            MailboxReceiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Build the mailbox pair for one machine. `capacity: None` selects the
/// unbounded default.
pub(crate) fn channel(
    shared: Arc<MachineShared>,
    capacity: Option<usize>,
) -> (Mailbox, MailboxReceiver) {
    match capacity {
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Mailbox {
                    shared,
                    tx: Tx::Unbounded(tx),
                },
                MailboxReceiver::Unbounded(rx),
            )
        }
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                Mailbox {
                    shared,
                    tx: Tx::Bounded(tx),
                },
                MailboxReceiver::Bounded(rx),
            )
        }
    }
}
