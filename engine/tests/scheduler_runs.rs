//! End-to-end scheduler runs on real files: removal during a run, stop with
//! mixed task states, adding while running and the notification stream.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use engine::{
    ChannelObserver, EngineError, Notification, SchedulerConfig, SchedulerState, Settings,
    TaskChange, TaskId, TaskObserver, TaskScheduler, TaskState, ENCRYPTED_SUFFIX,
};

const LARGE_FILE: usize = 8 * 1024 * 1024;

fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).expect("Failed to write file");
    path
}

fn scheduler(workers: usize) -> TaskScheduler {
    let settings = Arc::new(Settings::new());
    settings.set_password("integration").unwrap();
    TaskScheduler::without_observer(SchedulerConfig { workers }, settings)
}

/// Poll `condition` until it holds; panics after 30 seconds.
fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn encrypted_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}

/// Parks the worker of one task at its first progress update and lets it go
/// when that task is removed, so the removal always meets a running job.
#[derive(Default)]
struct HoldUntilRemoved {
    target: OnceLock<TaskId>,
    gate: Mutex<Gate>,
    changed: Condvar,
}

#[derive(Default)]
struct Gate {
    held: bool,
    released: bool,
}

impl HoldUntilRemoved {
    fn wait_until_held(&self) {
        let gate = self.gate.lock().unwrap();
        let (_gate, timeout) = self
            .changed
            .wait_timeout_while(gate, Duration::from_secs(30), |gate| !gate.held)
            .unwrap();
        assert!(!timeout.timed_out(), "target job never made progress");
    }
}

impl TaskObserver for HoldUntilRemoved {
    fn on_task_added(&self, _index: usize, _id: TaskId, _input_path: &Path) {}

    fn on_task_removed(&self, _index: usize, id: TaskId) {
        if self.target.get() == Some(&id) {
            self.gate.lock().unwrap().released = true;
            self.changed.notify_all();
        }
    }

    fn on_task_changed(&self, id: TaskId, change: &TaskChange) {
        if self.target.get() != Some(&id) || !matches!(change, TaskChange::Progress(_)) {
            return;
        }
        let mut gate = self.gate.lock().unwrap();
        gate.held = true;
        self.changed.notify_all();
        while !gate.released {
            gate = self.changed.wait(gate).unwrap();
        }
    }

    fn on_scheduler_state_changed(&self, _state: SchedulerState) {}
}

#[test]
fn test_remove_running_task_leaves_others_untouched() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let settings = Arc::new(Settings::new());
    settings.set_password("integration").unwrap();
    let observer = Arc::new(HoldUntilRemoved::default());
    let scheduler =
        TaskScheduler::new(SchedulerConfig { workers: 3 }, settings, observer.clone());

    let paths: Vec<PathBuf> = ["a.bin", "b.bin", "c.bin"]
        .iter()
        .map(|name| write_file(temp_dir.path(), name, 64 * 1024))
        .collect();
    let mut ids = Vec::new();
    for path in &paths {
        ids.push(scheduler.add_task(path).unwrap());
    }
    observer.target.set(ids[1]).unwrap();

    scheduler.start().unwrap();
    let removed = scheduler.task(1).unwrap();
    observer.wait_until_held();

    scheduler.remove_task(1).unwrap();

    // remove_task returns only once the job has let go of the task
    assert_eq!(removed.state(), TaskState::Failed);
    assert_eq!(removed.last_error().as_deref(), Some("Aborted"));
    assert!(removed.output_path().is_none());
    assert!(!encrypted_name(&paths[1]).exists(), "partial output removed");

    scheduler.wait_for_idle();
    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].input_path, paths[0]);
    assert_eq!(snapshot[1].input_path, paths[2]);
    for task in &snapshot {
        assert_eq!(task.state, TaskState::Succeeded, "{:?}", task);
        let expected = encrypted_name(&task.input_path);
        assert_eq!(task.output_path.as_deref(), Some(expected.as_path()));
    }
}

#[test]
fn test_remove_finished_task_does_not_block() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let scheduler = scheduler(2);
    let path = write_file(temp_dir.path(), "done.txt", 100);
    scheduler.add_task(&path).unwrap();

    scheduler.start().unwrap();
    scheduler.wait_for_idle();
    let finished = scheduler.task(0).unwrap();

    scheduler.remove_task(0).unwrap();
    assert!(scheduler.is_empty());
    assert_eq!(finished.state(), TaskState::Succeeded);
    assert!(encrypted_name(&path).exists());
}

#[test]
fn test_stop_aborts_queued_and_running_work() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let scheduler = scheduler(1);
    let small = write_file(temp_dir.path(), "small.txt", 100);
    let big = write_file(temp_dir.path(), "big.bin", LARGE_FILE);
    let waiting = write_file(temp_dir.path(), "waiting.bin", 1000);
    for path in [&small, &big, &waiting] {
        scheduler.add_task(path).unwrap();
    }

    scheduler.start().unwrap();
    let big_task = scheduler.task(1).unwrap();
    wait_until("big task to make progress", || big_task.progress() > 0);

    scheduler.stop().unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot[0].state, TaskState::Succeeded);
    assert!(encrypted_name(&small).exists());

    for task in &snapshot[1..] {
        assert_eq!(task.state, TaskState::Failed, "{:?}", task);
        assert_eq!(task.last_error.as_deref(), Some("Aborted"));
        assert!(task.output_path.is_none());
        assert!(!encrypted_name(&task.input_path).exists());
    }

    // Stopping again is rejected, starting again reruns everything
    assert!(matches!(scheduler.stop(), Err(EngineError::InvalidState { .. })));
    scheduler.start().unwrap();
    scheduler.wait_for_idle();
    assert!(scheduler
        .snapshot()
        .iter()
        .all(|task| task.state == TaskState::Succeeded));
}

#[test]
fn test_stop_with_two_jobs_mid_stream() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let scheduler = scheduler(3);
    let done = write_file(temp_dir.path(), "done.txt", 10);
    let first = write_file(temp_dir.path(), "first.bin", LARGE_FILE);
    let second = write_file(temp_dir.path(), "second.bin", LARGE_FILE);
    for path in [&done, &first, &second] {
        scheduler.add_task(path).unwrap();
    }

    scheduler.start().unwrap();
    let tasks = scheduler.tasks();
    wait_until("small task to finish", || tasks[0].state() == TaskState::Succeeded);
    wait_until("both large tasks to make progress", || {
        tasks[1].progress() > 0 && tasks[2].progress() > 0
    });

    scheduler.stop().unwrap();

    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(tasks[0].state(), TaskState::Succeeded);
    for task in &tasks[1..] {
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.last_error().as_deref(), Some("Aborted"));
        assert!(!encrypted_name(task.input_path()).exists());
    }
}

#[test]
fn test_start_while_running_is_rejected() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let scheduler = scheduler(1);
    let big = write_file(temp_dir.path(), "big.bin", LARGE_FILE);
    scheduler.add_task(&big).unwrap();

    scheduler.start().unwrap();
    match scheduler.start() {
        Err(EngineError::InvalidState {
            expected: SchedulerState::Idle,
            actual,
        }) => assert_ne!(actual, SchedulerState::Idle),
        // The run already completed on its own
        Ok(()) => {}
        Err(other) => panic!("unexpected error: {}", other),
    }
    scheduler.wait_for_idle();
}

#[test]
fn test_task_added_while_running_joins_the_run() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let scheduler = scheduler(1);
    let big = write_file(temp_dir.path(), "big.bin", LARGE_FILE);
    let late = write_file(temp_dir.path(), "late.txt", 10);
    scheduler.add_task(&big).unwrap();

    scheduler.start().unwrap();
    let big_task = scheduler.task(0).unwrap();
    wait_until("big task to make progress", || big_task.progress() > 0);

    scheduler.add_task(&late).unwrap();
    scheduler.wait_for_idle();

    let late_task = scheduler.task(1).unwrap();
    match late_task.state() {
        TaskState::Succeeded => assert!(encrypted_name(&late).exists()),
        // Only possible if the run had already completed when the task was added
        TaskState::New => assert!(!encrypted_name(&late).exists()),
        other => panic!("unexpected state {}", other),
    }
    assert_eq!(big_task.state(), TaskState::Succeeded);
}

#[test]
fn test_round_trip_through_scheduler() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let original = write_file(temp_dir.path(), "archive.tar.gz", 5000);
    let contents = fs::read(&original).unwrap();

    let encrypt = scheduler(2);
    encrypt.add_task(&original).unwrap();
    encrypt.start().unwrap();
    encrypt.wait_for_idle();
    let encrypted = encrypt.snapshot()[0].output_path.clone().unwrap();

    let decrypt = scheduler(2);
    decrypt.add_task(&encrypted).unwrap();
    decrypt.start().unwrap();
    decrypt.wait_for_idle();

    let snapshot = &decrypt.snapshot()[0];
    assert_eq!(snapshot.state, TaskState::Succeeded);
    let restored = snapshot.output_path.clone().unwrap();
    assert_eq!(restored, temp_dir.path().join("archive-1.tar.gz"));
    assert_eq!(fs::read(restored).unwrap(), contents);
}

#[test]
fn test_notification_stream() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let settings = Arc::new(Settings::new());
    settings.set_password("integration").unwrap();
    let (observer, receiver) = ChannelObserver::channel();
    let scheduler =
        TaskScheduler::new(SchedulerConfig { workers: 2 }, settings, Arc::new(observer));

    let first = write_file(temp_dir.path(), "first.txt", 3000);
    let second = write_file(temp_dir.path(), "second.txt", 10);
    let first_id = scheduler.add_task(&first).unwrap();
    let second_id = scheduler.add_task(&second).unwrap();

    scheduler.start().unwrap();
    scheduler.wait_for_idle();
    scheduler.remove_task(0).unwrap();

    let notifications: Vec<Notification> = receiver.try_iter().collect();

    assert_eq!(
        notifications[0],
        Notification::TaskAdded {
            index: 0,
            id: first_id,
            input_path: first.clone(),
        }
    );
    assert_eq!(
        notifications[1],
        Notification::TaskAdded {
            index: 1,
            id: second_id,
            input_path: second.clone(),
        }
    );
    assert_eq!(
        notifications.last(),
        Some(&Notification::TaskRemoved {
            index: 0,
            id: first_id,
        })
    );

    let states: Vec<SchedulerState> = notifications
        .iter()
        .filter_map(|n| match n {
            Notification::SchedulerStateChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![SchedulerState::Starting, SchedulerState::Running, SchedulerState::Idle]
    );

    for id in [first_id, second_id] {
        let changes: Vec<&TaskChange> = notifications
            .iter()
            .filter_map(|n| match n {
                Notification::TaskChanged { id: changed, change } if *changed == id => Some(change),
                _ => None,
            })
            .collect();
        assert_eq!(changes.first(), Some(&&TaskChange::State(TaskState::Queued)));
        assert_eq!(changes.get(1), Some(&&TaskChange::State(TaskState::Running)));
        assert_eq!(changes.last(), Some(&&TaskChange::Progress(100)));
        assert!(changes.contains(&&TaskChange::State(TaskState::Succeeded)));
    }
}
