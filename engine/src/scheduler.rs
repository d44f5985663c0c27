//! Task scheduler.
//!
//! Owns the task registry (one `TaskJob` per `Task`) and a worker pool, and
//! drives the global run state:
//!
//! ```text
//! Idle --start--> Starting --> Running --stop--> Stopping --> Idle
//!                              Running --last job done--> Idle
//! ```
//!
//! `start`/`stop` are rejected unless the scheduler is in the state they
//! expect, so at most one of them is in flight at a time. `remove_task` and
//! `stop` are the only blocking calls: both wait for running jobs to notice
//! their cancellation flag.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::error::EngineError;
use crate::job::TaskJob;
use crate::pool::WorkerPool;
use crate::progress::{NullObserver, TaskObserver};
use crate::settings::{CredentialSource, Credentials};
use crate::task::{Task, TaskId, TaskSnapshot};

/// Global run state of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "Idle"),
            SchedulerState::Starting => write!(f, "Starting"),
            SchedulerState::Running => write!(f, "Running"),
            SchedulerState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads (jobs transformed in parallel)
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        SchedulerConfig { workers }
    }
}

#[derive(Clone)]
struct Entry {
    task: Arc<Task>,
    job: Arc<TaskJob>,
}

struct Core {
    state: SchedulerState,
    entries: Vec<Entry>,
    /// Snapshot taken at `start`, used by every job of the run
    credentials: Option<Arc<Credentials>>,
}

/// State shared with the work items running on the pool.
struct Shared {
    core: Mutex<Core>,
    state_changed: Condvar,
    observer: Arc<dyn TaskObserver>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, core: &mut Core, state: SchedulerState) {
        if core.state != state {
            info!("Scheduler {} -> {}", core.state, state);
            core.state = state;
            self.observer.on_scheduler_state_changed(state);
            self.state_changed.notify_all();
        }
    }

    /// Running -> Idle once no job is queued or running.
    fn complete_if_drained(&self, core: &mut Core) {
        if core.state == SchedulerState::Running
            && !core.entries.iter().any(|e| e.job.is_active())
        {
            debug!("all jobs finished");
            core.credentials = None;
            self.set_state(core, SchedulerState::Idle);
        }
    }

    fn on_job_finished(&self) {
        let mut core = self.lock();
        self.complete_if_drained(&mut core);
    }
}

/// Runs one cancellable transform per registered file on a worker pool.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    pool: WorkerPool,
    credentials: Arc<dyn CredentialSource>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        credentials: Arc<dyn CredentialSource>,
        observer: Arc<dyn TaskObserver>,
    ) -> Self {
        info!(workers = config.workers, "Creating task scheduler");
        TaskScheduler {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: SchedulerState::Idle,
                    entries: Vec::new(),
                    credentials: None,
                }),
                state_changed: Condvar::new(),
                observer,
            }),
            pool: WorkerPool::new(config.workers),
            credentials,
        }
    }

    /// Scheduler without an observer
    pub fn without_observer(
        config: SchedulerConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self::new(config, credentials, Arc::new(NullObserver))
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.lock().state
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered tasks in insertion order
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.shared
            .lock()
            .entries
            .iter()
            .map(|e| Arc::clone(&e.task))
            .collect()
    }

    pub fn task(&self, index: usize) -> Option<Arc<Task>> {
        self.shared
            .lock()
            .entries
            .get(index)
            .map(|e| Arc::clone(&e.task))
    }

    /// Plain copies of every task, in insertion order
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.shared
            .lock()
            .entries
            .iter()
            .map(|e| e.task.snapshot())
            .collect()
    }

    fn submit(&self, job: Arc<TaskJob>, credentials: Arc<Credentials>) {
        let shared = Arc::clone(&self.shared);
        self.pool.execute(move || {
            job.run(&credentials);
            shared.on_job_finished();
        });
    }

    /// Register a file.
    ///
    /// Fails if a task with the same input path is already registered. While
    /// the scheduler is Running, the new job is queued right away.
    pub fn add_task(&self, input_path: impl AsRef<Path>) -> Result<TaskId, EngineError> {
        let input_path: PathBuf = input_path.as_ref().to_path_buf();
        let mut core = self.shared.lock();

        if core.entries.iter().any(|e| e.task.input_path() == input_path) {
            return Err(EngineError::DuplicateTask { path: input_path });
        }

        let task = Arc::new(Task::new(input_path, Arc::clone(&self.shared.observer)));
        let job = Arc::new(TaskJob::new(Arc::clone(&task)));
        let index = core.entries.len();
        let id = task.id();

        core.entries.push(Entry {
            task: Arc::clone(&task),
            job: Arc::clone(&job),
        });
        info!(index, path = %task.input_path().display(), "Task added");
        self.shared.observer.on_task_added(index, id, task.input_path());

        if core.state == SchedulerState::Running {
            if let Some(credentials) = core.credentials.clone() {
                task.queue();
                if job.mark_queued() {
                    self.submit(job, credentials);
                }
            }
        }

        Ok(id)
    }

    /// Unregister the task at `index`.
    ///
    /// If its job is running, blocks until the job has observed the
    /// cancellation request and stopped. A queued job is simply dropped.
    /// The cancellation request is in place before observers hear about the
    /// removal.
    pub fn remove_task(&self, index: usize) -> Result<(), EngineError> {
        let (entry, interrupted) = {
            let mut core = self.shared.lock();
            if index >= core.entries.len() {
                return Err(EngineError::IndexOutOfRange {
                    index,
                    len: core.entries.len(),
                });
            }
            let entry = core.entries.remove(index);
            entry.task.mute();
            let interrupted = !entry.job.unqueue() && entry.job.is_running();
            if interrupted {
                entry.job.request_interruption();
            }
            info!(index, path = %entry.task.input_path().display(), "Task removed");
            self.shared.observer.on_task_removed(index, entry.task.id());
            (entry, interrupted)
        };

        if interrupted {
            debug!(path = %entry.task.input_path().display(), "waiting for removed job to stop");
            entry.job.wait_until_finished();
        }

        // The removed job may have been the last one keeping the run alive.
        self.shared.on_job_finished();
        Ok(())
    }

    /// Queue every registered task and move to Running.
    ///
    /// Requires Idle state, at least one task, and a configured password.
    /// All jobs of the run use the credentials configured at this call.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut core = self.shared.lock();

        if core.state != SchedulerState::Idle {
            return Err(EngineError::InvalidState {
                expected: SchedulerState::Idle,
                actual: core.state,
            });
        }
        if core.entries.is_empty() {
            return Err(EngineError::NoTasks);
        }
        let credentials = self
            .credentials
            .credentials()
            .ok_or(EngineError::PasswordNotSet)?;

        self.shared.set_state(&mut core, SchedulerState::Starting);
        core.credentials = Some(Arc::clone(&credentials));

        for entry in &core.entries {
            entry.task.queue();
            if entry.job.mark_queued() {
                self.submit(Arc::clone(&entry.job), Arc::clone(&credentials));
            }
        }

        self.shared.set_state(&mut core, SchedulerState::Running);
        // Jobs that finished while we were still Starting did not trigger completion.
        self.shared.complete_if_drained(&mut core);
        Ok(())
    }

    /// Cancel the run.
    ///
    /// Jobs still waiting for a worker are marked Failed("Aborted"); running
    /// jobs are asked to stop and this call blocks until they have. Tasks that
    /// already finished keep their state.
    pub fn stop(&self) -> Result<(), EngineError> {
        let entries = {
            let mut core = self.shared.lock();
            if core.state != SchedulerState::Running {
                return Err(EngineError::InvalidState {
                    expected: SchedulerState::Running,
                    actual: core.state,
                });
            }
            self.shared.set_state(&mut core, SchedulerState::Stopping);
            core.entries.clone()
        };

        for entry in &entries {
            if entry.job.unqueue() {
                entry.task.fail("Aborted");
            } else {
                entry.job.request_interruption();
            }
        }
        self.pool.clear();
        self.pool.wait_for_done();

        let mut core = self.shared.lock();
        core.credentials = None;
        self.shared.set_state(&mut core, SchedulerState::Idle);
        Ok(())
    }

    /// Block until the scheduler is Idle.
    pub fn wait_for_idle(&self) {
        let mut core = self.shared.lock();
        while core.state != SchedulerState::Idle {
            core = self
                .shared
                .state_changed
                .wait(core)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if self.state() == SchedulerState::Running {
            let _ = self.stop();
        }
    }
}
