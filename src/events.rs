//! Task state-change notifications.
//!
//! Every start and stop pushes a [`TaskEvent`] into a small bounded channel
//! without waiting. When the buffer is full the event is dropped: consumers
//! treat any received event as "something changed" and re-read the full
//! state, so a lost event only delays the next refresh.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Buffer size of the supervisor's notification channel.
pub const NOTIFY_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventKind {
    Started,
    Stopped,
}

/// A task changed state. Carries no delta beyond which task it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub workspace: String,
    pub task: String,
    pub kind: TaskEventKind,
}

/// Non-blocking producer side of the notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<TaskEvent>>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that discards everything, for ephemeral tasks.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self, event: TaskEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => trace!("task event queued"),
            Err(TrySendError::Full(event)) => {
                debug!(workspace = %event.workspace, task = %event.task, kind = ?event.kind, "notification channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
