//! # Haralug Engine - Password-Based File Encryption Library
//!
//! A headless engine that encrypts and decrypts a list of files in parallel.
//! Designed as the foundation for multiple front ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! - Password-based AES-256-CBC encryption, key derived with SHA-512
//! - Encrypted files carry an HMAC-SHA512 password signature up front, so a
//!   wrong password is detected before anything is written
//! - Direction is chosen per file: `*.haralug` is decrypted, anything else
//!   is encrypted
//! - Outputs never overwrite existing files
//! - One job per file on a bounded worker pool, cancellable at chunk
//!   boundaries
//! - Change notifications via an observer trait (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine::{SchedulerConfig, Settings, TaskScheduler, TaskState};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Arc::new(Settings::new());
//! settings.set_password("correct horse battery staple")?;
//!
//! let scheduler = TaskScheduler::without_observer(SchedulerConfig::default(), settings);
//! scheduler.add_task("/home/me/report.pdf")?;
//! scheduler.add_task("/home/me/photo.jpg.haralug")?;
//!
//! scheduler.start()?;
//! scheduler.wait_for_idle();
//!
//! for task in scheduler.snapshot() {
//!     if task.state == TaskState::Succeeded {
//!         println!("{} -> {:?}", task.input_path.display(), task.output_path);
//!     } else {
//!         println!("{}: {:?}", task.input_path.display(), task.last_error);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **crypto**: Hashing, signing, streaming AES-256-CBC
//! - **error**: Error types
//! - **settings**: Password and signature store
//! - **task**: Per-file task records
//! - **progress**: Observer trait and channel observer
//! - **job**: The per-file streaming transform
//! - **pool**: Fixed-size worker pool
//! - **scheduler**: Task registry and global run state

pub mod crypto;
pub mod error;
pub mod job;
pub mod pool;
pub mod progress;
pub mod scheduler;
pub mod settings;
pub mod task;

// Re-export main types
pub use crypto::{CipherMode, HashAlgorithm, StreamingTransform};
pub use error::{CryptoError, CryptoErrorKind, EngineError, JobError};
pub use job::{TaskJob, CHUNK_SIZE, ENCRYPTED_SUFFIX};
pub use progress::{ChannelObserver, Notification, NullObserver, TaskChange, TaskObserver};
pub use scheduler::{SchedulerConfig, SchedulerState, TaskScheduler};
pub use settings::{CredentialSource, Credentials, Settings, APP_TOKEN};
pub use task::{Task, TaskId, TaskSnapshot, TaskState};
