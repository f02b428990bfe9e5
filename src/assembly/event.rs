//! Assembly event stream: task → coordinator signalling.
//!
//! Every assembler task reports through one unbounded `mpsc` channel. The
//! coordinator is the only reader and keeps nothing but counters.
//!
//! Sends never block, so they may happen while the Module Store lock is held.
//! That is what keeps a waiter's `Blocked` strictly ahead of the `Resumed`
//! emitted for it by the publisher.

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TaskError;

#[derive(Debug)]
pub enum EventKind {
    /// The task started waiting for an unpublished name.
    Blocked,
    /// A wait of the task was satisfied by a publish.
    Resumed,
    /// The task terminated. Emitted exactly once per task.
    Finished(Result<(), TaskError>),
}

#[derive(Debug)]
pub struct Event {
    pub task: String,
    pub kind: EventKind,
}

/// Cloneable producer side of the event stream.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn blocked(&self, task: &str) {
        self.send(task, EventKind::Blocked);
    }

    pub fn resumed(&self, task: &str) {
        self.send(task, EventKind::Resumed);
    }

    pub fn finished(&self, task: &str, result: Result<(), TaskError>) {
        self.send(task, EventKind::Finished(result));
    }

    // The coordinator may already have given up; late events are dropped.
    fn send(&self, task: &str, kind: EventKind) {
        trace!(task, ?kind, "assembly event");
        let _ = self.tx.send(Event { task: task.to_string(), kind });
    }
}
