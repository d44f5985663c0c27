//! Task records.
//!
//! A Task is one file's encrypt/decrypt operation:
//! - identity: its input path (plus a generated id for notifications)
//! - observable fields: output path, last error, progress, state
//!
//! Every field change is pushed to the task's observer. Only the job running
//! the task and the scheduler mutate it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::progress::{TaskChange, TaskObserver};

/// Identifier of a registered task, stable for the task's lifetime
pub type TaskId = Uuid;

/// The state of a single task.
///
/// `New -> Queued -> Running -> {Succeeded | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Registered, never started
    New,
    /// Submitted to the worker pool, waiting for a worker
    Queued,
    /// A worker is transforming the file
    Running,
    /// Output file fully written
    Succeeded,
    /// Error, wrong password or aborted; see the last error
    Failed,
}

impl TaskState {
    /// Returns true if this state is terminal (no further changes expected in this run).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::New => write!(f, "New"),
            TaskState::Queued => write!(f, "Queued"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Succeeded => write!(f, "Succeeded"),
            TaskState::Failed => write!(f, "Failed"),
        }
    }
}

/// Plain copy of a task's fields, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub last_error: Option<String>,
    /// Percentage, 0..=100
    pub progress: u8,
    pub state: TaskState,
}

#[derive(Debug)]
struct TaskFields {
    output_path: Option<PathBuf>,
    last_error: Option<String>,
    progress: u8,
    state: TaskState,
}

/// One file's transform with observable lifecycle state.
pub struct Task {
    id: TaskId,
    input_path: PathBuf,
    fields: Mutex<TaskFields>,
    observer: Arc<dyn TaskObserver>,
    muted: AtomicBool,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("input_path", &self.input_path)
            .field("fields", &*self.lock())
            .finish()
    }
}

impl Task {
    pub(crate) fn new(input_path: impl Into<PathBuf>, observer: Arc<dyn TaskObserver>) -> Self {
        Task {
            id: Uuid::new_v4(),
            input_path: input_path.into(),
            fields: Mutex::new(TaskFields {
                output_path: None,
                last_error: None,
                progress: 0,
                state: TaskState::New,
            }),
            observer,
            muted: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskFields> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.lock().output_path.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn progress(&self) -> u8 {
        self.lock().progress
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    /// Stop notifying the observer. Used when the task leaves the registry
    /// while its job may still be winding down.
    pub(crate) fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    fn notify(&self, change: TaskChange) {
        if !self.muted.load(Ordering::SeqCst) {
            self.observer.on_task_changed(self.id, &change);
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let fields = self.lock();
        TaskSnapshot {
            id: self.id,
            input_path: self.input_path.clone(),
            output_path: fields.output_path.clone(),
            last_error: fields.last_error.clone(),
            progress: fields.progress,
            state: fields.state,
        }
    }

    // Setters notify only on an actual change. The observer is called with the
    // field lock held so that notifications for one task stay ordered.

    pub(crate) fn set_output_path(&self, output_path: Option<PathBuf>) {
        let mut fields = self.lock();
        if fields.output_path != output_path {
            fields.output_path = output_path.clone();
            self.notify(TaskChange::OutputPath(output_path));
        }
    }

    pub(crate) fn set_last_error(&self, last_error: Option<String>) {
        let mut fields = self.lock();
        if fields.last_error != last_error {
            fields.last_error = last_error.clone();
            self.notify(TaskChange::LastError(last_error));
        }
    }

    pub(crate) fn set_progress(&self, progress: u8) {
        let progress = progress.min(100);
        let mut fields = self.lock();
        if fields.progress != progress {
            fields.progress = progress;
            self.notify(TaskChange::Progress(progress));
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        let mut fields = self.lock();
        if fields.state != state {
            fields.state = state;
            self.notify(TaskChange::State(state));
        }
    }

    /// Record a failure: last error first, then the Failed state.
    pub(crate) fn fail(&self, message: impl Into<String>) {
        self.set_last_error(Some(message.into()));
        self.set_state(TaskState::Failed);
    }

    /// Prepare for a new run: clear previous results and mark Queued.
    pub(crate) fn queue(&self) {
        self.set_progress(0);
        self.set_last_error(None);
        self.set_output_path(None);
        self.set_state(TaskState::Queued);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullObserver;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingObserver {
        changes: StdMutex<Vec<TaskChange>>,
    }

    impl TaskObserver for RecordingObserver {
        fn on_task_added(&self, _index: usize, _id: TaskId, _input_path: &Path) {}
        fn on_task_removed(&self, _index: usize, _id: TaskId) {}
        fn on_task_changed(&self, _id: TaskId, change: &TaskChange) {
            self.changes.lock().unwrap().push(change.clone());
        }
        fn on_scheduler_state_changed(&self, _state: crate::scheduler::SchedulerState) {}
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("/data/report.txt", Arc::new(NullObserver));
        let snapshot = task.snapshot();

        assert_eq!(snapshot.input_path, PathBuf::from("/data/report.txt"));
        assert_eq!(snapshot.state, TaskState::New);
        assert_eq!(snapshot.progress, 0);
        assert!(snapshot.output_path.is_none());
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn test_setters_notify_only_on_change() {
        let observer = Arc::new(RecordingObserver::default());
        let task = Task::new("a.txt", observer.clone());

        task.set_progress(5);
        task.set_progress(5);
        task.set_state(TaskState::Running);
        task.set_state(TaskState::Running);
        task.set_last_error(Some("boom".to_string()));
        task.set_last_error(Some("boom".to_string()));

        let changes = observer.changes.lock().unwrap().clone();
        assert_eq!(
            changes,
            vec![
                TaskChange::Progress(5),
                TaskChange::State(TaskState::Running),
                TaskChange::LastError(Some("boom".to_string())),
            ]
        );
    }

    #[test]
    fn test_muted_task_changes_silently() {
        let observer = Arc::new(RecordingObserver::default());
        let task = Task::new("a.txt", observer.clone());
        task.mute();
        task.fail("Aborted");

        assert_eq!(task.state(), TaskState::Failed);
        assert!(observer.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_progress_is_clamped() {
        let task = Task::new("a.txt", Arc::new(NullObserver));
        task.set_progress(250);
        assert_eq!(task.progress(), 100);
    }

    #[test]
    fn test_fail_records_error_then_state() {
        let observer = Arc::new(RecordingObserver::default());
        let task = Task::new("a.txt", observer.clone());
        task.fail("Aborted");

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.last_error().as_deref(), Some("Aborted"));
        let changes = observer.changes.lock().unwrap().clone();
        assert_eq!(
            changes,
            vec![
                TaskChange::LastError(Some("Aborted".to_string())),
                TaskChange::State(TaskState::Failed),
            ]
        );
    }

    #[test]
    fn test_queue_resets_previous_run() {
        let task = Task::new("a.txt", Arc::new(NullObserver));
        task.set_progress(100);
        task.set_output_path(Some(PathBuf::from("a.txt.haralug")));
        task.set_state(TaskState::Succeeded);

        task.queue();

        let snapshot = task.snapshot();
        assert_eq!(snapshot.state, TaskState::Queued);
        assert_eq!(snapshot.progress, 0);
        assert!(snapshot.output_path.is_none());
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::New.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
