//! Change notifications.
//!
//! This module defines the `TaskObserver` trait, which decouples the engine
//! from whatever presents the task list (CLI progress bars, a window, tests).
//!
//! Task changes are reported from the worker thread that runs the job, so
//! observers must be thread-safe. `ChannelObserver` forwards everything over a
//! crossbeam channel for consumers that want to handle updates on their own
//! thread. Notifications for one task arrive in the order they happened.
//!
//! Observers are called while engine locks are held: they must not call back
//! into the scheduler.

use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::scheduler::SchedulerState;
use crate::task::{TaskId, TaskState};

/// One field of a task changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskChange {
    OutputPath(Option<PathBuf>),
    LastError(Option<String>),
    Progress(u8),
    State(TaskState),
}

/// Trait for receiving task and scheduler updates.
pub trait TaskObserver: Send + Sync {
    /// A task was registered at `index`.
    fn on_task_added(&self, index: usize, id: TaskId, input_path: &Path);

    /// The task previously at `index` was unregistered.
    fn on_task_removed(&self, index: usize, id: TaskId);

    /// A field of a registered task changed.
    fn on_task_changed(&self, id: TaskId, change: &TaskChange);

    /// The scheduler moved to a new global state.
    fn on_scheduler_state_changed(&self, state: SchedulerState);
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TaskObserver for NullObserver {
    fn on_task_added(&self, _index: usize, _id: TaskId, _input_path: &Path) {}
    fn on_task_removed(&self, _index: usize, _id: TaskId) {}
    fn on_task_changed(&self, _id: TaskId, _change: &TaskChange) {}
    fn on_scheduler_state_changed(&self, _state: SchedulerState) {}
}

/// A notification as delivered by `ChannelObserver`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    TaskAdded {
        index: usize,
        id: TaskId,
        input_path: PathBuf,
    },
    TaskRemoved {
        index: usize,
        id: TaskId,
    },
    TaskChanged {
        id: TaskId,
        change: TaskChange,
    },
    SchedulerStateChanged(SchedulerState),
}

/// A TaskObserver implementation that sends notifications through a channel.
///
/// Sending never blocks (the channel is unbounded). If the receiver is gone,
/// notifications are dropped.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<Notification>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<Notification>) -> Self {
        ChannelObserver { sender }
    }

    /// Create an observer together with the receiving end of its channel.
    pub fn channel() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = unbounded();
        (ChannelObserver::new(sender), receiver)
    }
}

impl TaskObserver for ChannelObserver {
    fn on_task_added(&self, index: usize, id: TaskId, input_path: &Path) {
        let _ = self.sender.send(Notification::TaskAdded {
            index,
            id,
            input_path: input_path.to_path_buf(),
        });
    }

    fn on_task_removed(&self, index: usize, id: TaskId) {
        let _ = self.sender.send(Notification::TaskRemoved { index, id });
    }

    fn on_task_changed(&self, id: TaskId, change: &TaskChange) {
        let _ = self.sender.send(Notification::TaskChanged {
            id,
            change: change.clone(),
        });
    }

    fn on_scheduler_state_changed(&self, state: SchedulerState) {
        let _ = self.sender.send(Notification::SchedulerStateChanged(state));
    }
}
