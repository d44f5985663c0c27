//! Haralug - Command-line interface for the encryption engine.
//!
//! Encrypts or decrypts every file given on the command line with one
//! password. Files ending in `.haralug` are decrypted, everything else is
//! encrypted; outputs are written next to the inputs and never overwrite an
//! existing file.

use anyhow::{bail, Context};
use clap::Parser;
use crossbeam_channel::{bounded, never, select, Receiver, TrySendError};
use engine::{
    job::plan_output, ChannelObserver, CipherMode, EngineError, Notification, SchedulerConfig,
    SchedulerState, Settings, TaskChange, TaskId, TaskScheduler, TaskSnapshot, TaskState,
};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Haralug - password-based file encryption
#[derive(Parser, Debug)]
#[command(name = "haralug")]
#[command(version = "0.1.0")]
#[command(about = "Encrypt and decrypt files with a password")]
struct Args {
    /// Files to process (*.haralug files are decrypted, others encrypted)
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Password (prompted for when not given)
    #[arg(long, env = "HARALUG_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Number of files processed in parallel (defaults to the CPU count)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,

    /// Do not draw progress bars
    #[arg(long)]
    no_progress: bool,
}

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunSummary {
    succeeded: usize,
    failed: usize,
}

/// What woke the CLI up while a run is in progress
enum RunEvent {
    Notification(Notification),
    Interrupt,
    InterruptsClosed,
    NotificationsClosed,
}

/// Progress bars driven by engine notifications, one per task.
struct CliProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<TaskId, (ProgressBar, String)>,
}

impl CliProgress {
    fn new(enabled: bool) -> anyhow::Result<Self> {
        let target = if enabled {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let style =
            ProgressStyle::with_template("{prefix:>8} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .context("Invalid progress bar template")?
                .progress_chars("#>-");

        Ok(CliProgress {
            multi: MultiProgress::with_draw_target(target),
            style,
            bars: HashMap::new(),
        })
    }

    /// Apply one notification. Returns false once the run is over.
    fn handle(&mut self, notification: Notification) -> bool {
        match notification {
            Notification::TaskAdded { id, input_path, .. } => {
                let name = display_name(&input_path);
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar.set_prefix("waiting");
                bar.set_message(name.clone());
                self.bars.insert(id, (bar, name));
            }
            Notification::TaskRemoved { id, .. } => {
                if let Some((bar, _)) = self.bars.remove(&id) {
                    self.multi.remove(&bar);
                }
            }
            Notification::TaskChanged { id, change } => {
                if let Some((bar, name)) = self.bars.get(&id) {
                    match change {
                        TaskChange::Progress(percent) => bar.set_position(u64::from(percent)),
                        TaskChange::State(TaskState::Queued) => bar.set_prefix("queued"),
                        TaskChange::State(TaskState::Running) => bar.set_prefix("running"),
                        TaskChange::State(TaskState::Succeeded) => {
                            bar.set_prefix("done");
                            bar.finish_with_message(name.clone());
                        }
                        TaskChange::State(TaskState::Failed) => {
                            bar.set_prefix("failed");
                            bar.abandon_with_message(name.clone());
                        }
                        TaskChange::State(TaskState::New)
                        | TaskChange::OutputPath(_)
                        | TaskChange::LastError(_) => {}
                    }
                }
            }
            Notification::SchedulerStateChanged(state) => {
                debug!(%state, "scheduler state changed");
                if state == SchedulerState::Idle {
                    return false;
                }
            }
        }
        true
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Ignore the error when a subscriber is already installed (tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Password from the command line / environment, or prompted for.
///
/// The prompt asks twice when at least one file is going to be encrypted.
fn resolve_password(args: &Args) -> anyhow::Result<Zeroizing<String>> {
    if let Some(password) = &args.password {
        return Ok(Zeroizing::new(password.clone()));
    }

    let password = Zeroizing::new(
        rpassword::prompt_password("Password: ").context("Failed to read password")?,
    );
    let encrypts = args
        .files
        .iter()
        .any(|file| plan_output(file).0 == CipherMode::Encrypt);
    if encrypts {
        let confirmation = Zeroizing::new(
            rpassword::prompt_password("Confirm password: ").context("Failed to read password")?,
        );
        if *confirmation != *password {
            bail!("Passwords do not match");
        }
    }
    Ok(password)
}

fn print_summary(snapshot: &[TaskSnapshot], elapsed: Duration, verbose: bool) -> RunSummary {
    let succeeded: Vec<&TaskSnapshot> = snapshot
        .iter()
        .filter(|task| task.state == TaskState::Succeeded)
        .collect();
    let failed: Vec<&TaskSnapshot> = snapshot
        .iter()
        .filter(|task| task.state == TaskState::Failed)
        .collect();
    let bytes: u64 = succeeded
        .iter()
        .filter_map(|task| std::fs::metadata(&task.input_path).ok())
        .map(|metadata| metadata.len())
        .sum();

    eprintln!();
    eprintln!("Summary: {} succeeded, {} failed", succeeded.len(), failed.len());

    if verbose {
        for task in &succeeded {
            if let Some(output) = &task.output_path {
                eprintln!("  {} -> {}", task.input_path.display(), output.display());
            }
        }
    }

    eprintln!("Processed: {}", format_bytes(bytes));
    eprintln!("Elapsed: {}", format_duration(elapsed));

    if !failed.is_empty() {
        eprintln!();
        eprintln!("Failed files:");
        for task in &failed {
            let reason = task.last_error.as_deref().unwrap_or("(unknown error)");
            eprintln!("  {}: {}", display_name(&task.input_path), reason);
        }
    }

    RunSummary {
        succeeded: succeeded.len(),
        failed: failed.len(),
    }
}

/// Forward Ctrl-C presses to a channel.
///
/// A dedicated thread drives a single-threaded tokio runtime that only waits
/// for the signal. Presses made while one is still pending are coalesced.
fn install_interrupt_handler() -> anyhow::Result<Receiver<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create signal runtime")?;
    let (sender, receiver) = bounded(1);

    thread::Builder::new()
        .name("haralug-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if let Err(TrySendError::Disconnected(_)) = sender.try_send(()) {
                        break;
                    }
                }
            });
        })
        .context("Failed to spawn signal thread")?;

    Ok(receiver)
}

/// Cancel the run after Ctrl-C. Aborted outputs are removed by the engine.
fn interrupt(scheduler: &TaskScheduler) -> anyhow::Result<()> {
    eprintln!("Interrupted, stopping...");
    match scheduler.stop() {
        // The run may have just finished on its own
        Ok(()) | Err(EngineError::InvalidState { .. }) => Ok(()),
        Err(e) => Err(e).context("Failed to stop"),
    }
}

/// Parse and validate command-line arguments, then run the batch
fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let interrupts = match install_interrupt_handler() {
        Ok(interrupts) => interrupts,
        Err(e) => {
            warn!("Ctrl-C handling unavailable: {:#}", e);
            never()
        }
    };

    let exit_code = match run_cli(&args, &interrupts) {
        Ok(summary) if summary.failed == 0 => 0,
        Ok(_) => 2,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
///
/// A message on `interrupts` stops the run; unfinished files count as failed.
fn run_cli(args: &Args, interrupts: &Receiver<()>) -> anyhow::Result<RunSummary> {
    for file in &args.files {
        if !file.exists() {
            bail!("File does not exist: {}", file.display());
        }
        if !file.is_file() {
            bail!("Not a regular file: {}", file.display());
        }
    }

    let config = match args.workers {
        Some(0) => bail!("--workers must be at least 1"),
        Some(workers) => SchedulerConfig { workers },
        None => SchedulerConfig::default(),
    };

    let password = resolve_password(args)?;
    let settings = Arc::new(Settings::new());
    settings.set_password(&password).context("Invalid password")?;

    let (observer, notifications) = ChannelObserver::channel();
    let scheduler = TaskScheduler::new(config, settings, Arc::new(observer));

    for file in &args.files {
        match scheduler.add_task(file) {
            Ok(_) => {}
            Err(e @ EngineError::DuplicateTask { .. }) => warn!("Skipping: {}", e),
            Err(e) => return Err(e).context("Failed to add file"),
        }
    }

    let mut progress = CliProgress::new(!args.no_progress)?;
    let start_time = Instant::now();
    scheduler.start().context("Failed to start")?;

    // Notifications stay ordered, so the final Idle comes after every task update
    let mut interrupts = interrupts.clone();
    loop {
        // A pending Ctrl-C wins over queued notifications
        let event = match interrupts.try_recv() {
            Ok(()) => RunEvent::Interrupt,
            Err(_) => select! {
                recv(notifications) -> notification => match notification {
                    Ok(notification) => RunEvent::Notification(notification),
                    Err(_) => RunEvent::NotificationsClosed,
                },
                recv(interrupts) -> signal => match signal {
                    Ok(()) => RunEvent::Interrupt,
                    Err(_) => RunEvent::InterruptsClosed,
                },
            },
        };
        match event {
            RunEvent::Notification(notification) => {
                if !progress.handle(notification) {
                    break;
                }
            }
            RunEvent::Interrupt => interrupt(&scheduler)?,
            RunEvent::InterruptsClosed => interrupts = never(),
            RunEvent::NotificationsClosed => break,
        }
    }
    scheduler.wait_for_idle();

    Ok(print_summary(&scheduler.snapshot(), start_time.elapsed(), args.verbose))
}
