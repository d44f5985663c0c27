//! Per-task jobs.
//!
//! A `TaskJob` runs one Task's streaming transform on a worker thread:
//! - deciding the direction from the file name (encrypted files end with
//!   `ENCRYPTED_SUFFIX`)
//! - choosing an output path that does not overwrite anything
//! - checking the signature prefix on decrypt
//! - streaming the file through the cipher in `CHUNK_SIZE` chunks, polling
//!   the cancellation flag before every chunk
//!
//! Every failure ends up on the Task (last error + Failed). Nothing escapes
//! `run`, and a failed or aborted job never leaves a partial output file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::crypto::{self, CipherMode, StreamingTransform};
use crate::error::JobError;
use crate::settings::Credentials;
use crate::task::{Task, TaskState};

/// Bytes read from the input per iteration (and cancellation polling granularity)
pub const CHUNK_SIZE: usize = 1024;

/// File-name marker of encrypted files
pub const ENCRYPTED_SUFFIX: &str = ".haralug";

/// How a file name is split into base name and suffix for collision renaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixRule {
    /// `a.b.c` -> (`a.b`, `c`)
    SingleExtension,
    /// `a.tar.gz` -> (`a`, `tar.gz`), falling back to the single rule
    DoubleExtension,
}

/// Decide direction and the preferred output path for `input`.
///
/// Files ending with `ENCRYPTED_SUFFIX` are decrypted to the name without
/// it; everything else is encrypted to the name with it appended.
pub fn plan_output(input: &Path) -> (CipherMode, PathBuf) {
    if let Some(name) = input.file_name().and_then(|n| n.to_str()) {
        if let Some(stem) = name.strip_suffix(ENCRYPTED_SUFFIX) {
            if !stem.is_empty() {
                return (CipherMode::Decrypt, input.with_file_name(stem));
            }
        }
    }

    let mut output = input.as_os_str().to_os_string();
    output.push(ENCRYPTED_SUFFIX);
    (CipherMode::Encrypt, PathBuf::from(output))
}

/// Split a file name into base name and suffix (suffix without the leading dot).
pub fn split_file_name(file_name: &str, rule: SuffixRule) -> (&str, &str) {
    if rule == SuffixRule::DoubleExtension {
        if let Some(last) = file_name.rfind('.') {
            if let Some(prev) = file_name[..last].rfind('.') {
                let base = &file_name[..prev];
                let middle = &file_name[prev + 1..last];
                let tail = &file_name[last + 1..];
                if !base.is_empty() && !middle.is_empty() && !tail.is_empty() {
                    return (base, &file_name[prev + 1..]);
                }
            }
        }
    }

    match file_name.rsplit_once('.') {
        Some((base, suffix)) if !base.is_empty() && !suffix.is_empty() => (base, suffix),
        _ => (file_name, ""),
    }
}

/// Find a path that does not exist yet, starting from `candidate`.
///
/// Existing candidates get a counter inserted before the suffix:
/// `base-1.suffix`, `base-2.suffix`, ... The existence check and the later
/// file creation are not atomic; the job creates the file with `create_new`
/// so a path that appears in between fails the task instead of being
/// overwritten.
pub fn resolve_output_path(candidate: &Path, rule: SuffixRule) -> PathBuf {
    if !candidate.exists() {
        return candidate.to_path_buf();
    }

    let directory = candidate.parent().unwrap_or_else(|| Path::new(""));
    let file_name = candidate
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (base, suffix) = split_file_name(&file_name, rule);

    let mut index: u64 = 1;
    loop {
        let name = if suffix.is_empty() {
            format!("{}-{}", base, index)
        } else {
            format!("{}-{}.{}", base, index, suffix)
        };
        let path = directory.join(name);
        if !path.exists() {
            return path;
        }
        index += 1;
    }
}

/// Output file that is deleted on drop unless committed.
struct PartialOutput {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl PartialOutput {
    fn create(path: PathBuf) -> Result<Self, JobError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| JobError::io(&path, e))?;
        Ok(PartialOutput {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), JobError> {
        if data.is_empty() {
            return Ok(());
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(data).map_err(|e| JobError::io(&self.path, e)),
            None => Err(JobError::io(
                &self.path,
                io::Error::new(ErrorKind::Other, "output already closed"),
            )),
        }
    }

    /// Flush and close; the file stays on disk.
    ///
    /// The writer is released only once flush and sync succeeded, so a failed
    /// commit still deletes the file on drop.
    fn commit(mut self) -> Result<PathBuf, JobError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| JobError::io(&self.path, e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| JobError::io(&self.path, e))?;
        }
        self.writer = None;
        Ok(std::mem::take(&mut self.path))
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            drop(writer);
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove partial output");
            } else {
                debug!(path = %self.path.display(), "removed partial output");
            }
        }
    }
}

/// Read until `buffer` is full or the input ends. Returns the bytes read.
fn read_chunk(input: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match input.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Idle,
    Queued,
    Running,
}

/// The executable companion of a registered Task.
///
/// The phase (idle / queued / running) lives under a mutex paired with a
/// condition variable; `wait_until_finished` checks the phase under that
/// mutex, so a job that finishes before the wait starts is still observed.
pub struct TaskJob {
    task: Arc<Task>,
    interruption_requested: AtomicBool,
    phase: Mutex<JobPhase>,
    finished: Condvar,
}

impl std::fmt::Debug for TaskJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskJob")
            .field("task", &self.task.input_path())
            .field("phase", &*self.lock_phase())
            .finish()
    }
}

impl TaskJob {
    pub fn new(task: Arc<Task>) -> Self {
        TaskJob {
            task,
            interruption_requested: AtomicBool::new(false),
            phase: Mutex::new(JobPhase::Idle),
            finished: Condvar::new(),
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, JobPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn is_running(&self) -> bool {
        *self.lock_phase() == JobPhase::Running
    }

    /// Queued or running
    pub fn is_active(&self) -> bool {
        *self.lock_phase() != JobPhase::Idle
    }

    /// Ask the job to stop at the next chunk boundary.
    pub fn request_interruption(&self) {
        self.interruption_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_interruption_requested(&self) -> bool {
        self.interruption_requested.load(Ordering::SeqCst)
    }

    /// Idle -> Queued. Clears any stale interruption request.
    ///
    /// Returns false if the job is already queued or running.
    pub fn mark_queued(&self) -> bool {
        let mut phase = self.lock_phase();
        if *phase != JobPhase::Idle {
            return false;
        }
        self.interruption_requested.store(false, Ordering::SeqCst);
        *phase = JobPhase::Queued;
        true
    }

    /// Queued -> Idle, for work that is cancelled before a worker picks it up.
    ///
    /// Returns false if the job was not queued (already running or idle).
    pub fn unqueue(&self) -> bool {
        let mut phase = self.lock_phase();
        if *phase != JobPhase::Queued {
            return false;
        }
        *phase = JobPhase::Idle;
        true
    }

    /// Block until the job is not running. Returns immediately if it is idle
    /// or only queued.
    pub fn wait_until_finished(&self) {
        let mut phase = self.lock_phase();
        while *phase == JobPhase::Running {
            phase = self
                .finished
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Execute the job if it is queued.
    ///
    /// Returns false when there was nothing to run (the job was unqueued in
    /// the meantime). Never panics and never returns an error: the outcome is
    /// recorded on the task.
    pub fn run(&self, credentials: &Credentials) -> bool {
        {
            let mut phase = self.lock_phase();
            if *phase != JobPhase::Queued {
                return false;
            }
            *phase = JobPhase::Running;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(credentials)));
        if outcome.is_err() {
            warn!(path = %self.task.input_path().display(), "job panicked");
            self.task.fail("Internal error");
        }

        *self.lock_phase() = JobPhase::Idle;
        self.finished.notify_all();
        true
    }

    fn execute(&self, credentials: &Credentials) {
        self.task.set_state(TaskState::Running);
        debug!(path = %self.task.input_path().display(), "job started");

        match self.transform(credentials) {
            Ok(output_path) => {
                info!(
                    input = %self.task.input_path().display(),
                    output = %output_path.display(),
                    "task succeeded"
                );
                self.task.set_output_path(Some(output_path));
                self.task.set_state(TaskState::Succeeded);
                self.task.set_progress(100);
            }
            Err(e) => {
                warn!(path = %self.task.input_path().display(), error = %e, "task failed");
                self.task.fail(e.to_string());
            }
        }
    }

    fn transform(&self, credentials: &Credentials) -> Result<PathBuf, JobError> {
        let input_path = self.task.input_path();
        let (mode, candidate) = plan_output(input_path);
        let rule = match mode {
            CipherMode::Encrypt => SuffixRule::SingleExtension,
            CipherMode::Decrypt => SuffixRule::DoubleExtension,
        };
        let output_path = resolve_output_path(&candidate, rule);

        let mut input = File::open(input_path).map_err(|e| JobError::io(input_path, e))?;
        let total_bytes = input
            .metadata()
            .map_err(|e| JobError::io(input_path, e))?
            .len();

        let signature = credentials.signature();
        let mut consumed: u64 = 0;

        if mode == CipherMode::Decrypt {
            let mut prefix = vec![0u8; signature.len()];
            let read =
                read_chunk(&mut input, &mut prefix).map_err(|e| JobError::io(input_path, e))?;
            if read != signature.len() || prefix != signature {
                return Err(JobError::WrongPassword);
            }
            consumed += read as u64;
        }

        let mut output = PartialOutput::create(output_path)?;
        if mode == CipherMode::Encrypt {
            output.write_all(signature)?;
        }

        let mut cipher = crypto::open_cipher(credentials.password(), mode)?;
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut progress: u8 = 0;

        loop {
            if self.is_interruption_requested() {
                return Err(JobError::Aborted);
            }

            let read =
                read_chunk(&mut input, &mut buffer).map_err(|e| JobError::io(input_path, e))?;
            if read == 0 {
                break;
            }
            consumed += read as u64;
            output.write_all(&cipher.update(&buffer[..read])?)?;

            // 100 is reserved for the committed result
            let new_progress = (consumed * 100 / total_bytes.max(1)).min(99) as u8;
            if new_progress > progress {
                progress = new_progress;
                self.task.set_progress(progress);
            }
        }

        output.write_all(&cipher.finalize()?)?;
        output.commit()
    }
}
