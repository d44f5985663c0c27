//! In-memory credential store.
//!
//! Holds the current password and its signature. The signature is the
//! HMAC-SHA512 of `APP_TOKEN` under the password; it is written in front of
//! every encrypted file and compared on decrypt to detect a wrong password.
//!
//! Nothing here is persisted. Credentials live until the password changes
//! or the process exits, and the password is wiped on drop.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::CryptoError;

/// Constant token signed to produce the password signature
pub const APP_TOKEN: &str = "Haralug";

/// A password together with its signature.
///
/// Immutable once built; a run holds an `Arc` to the snapshot taken at start.
pub struct Credentials {
    password: Zeroizing<String>,
    signature: Vec<u8>,
}

impl Credentials {
    /// Derive the signature for `password`.
    ///
    /// Fails with an empty-password error for `""`.
    pub fn new(password: &str) -> Result<Self, CryptoError> {
        let signature = crypto::sign(APP_TOKEN.as_bytes(), password)?;
        Ok(Credentials {
            password: Zeroizing::new(password.to_string()),
            signature,
        })
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"<redacted>")
            .field("signature_len", &self.signature.len())
            .finish()
    }
}

/// Something the scheduler can ask for the current credentials.
pub trait CredentialSource: Send + Sync {
    /// Snapshot of the configured credentials, `None` when no password is set.
    fn credentials(&self) -> Option<Arc<Credentials>>;
}

/// Password/signature pair shared between the front end and the scheduler.
///
/// Changing the password while a run is in progress is not supported; the
/// running jobs keep the snapshot they were started with.
#[derive(Default)]
pub struct Settings {
    current: RwLock<Option<Arc<Credentials>>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the password and recompute the signature.
    ///
    /// Setting the same password again does nothing. On failure the previous
    /// credentials are kept.
    pub fn set_password(&self, password: &str) -> Result<(), CryptoError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = current.as_ref() {
            if existing.password() == password {
                return Ok(());
            }
        }

        let credentials = Credentials::new(password)?;
        debug!(signature_len = credentials.signature().len(), "password updated");
        *current = Some(Arc::new(credentials));
        Ok(())
    }

    /// Current password, if any
    pub fn password(&self) -> Option<Zeroizing<String>> {
        self.credentials()
            .map(|c| Zeroizing::new(c.password().to_string()))
    }

    /// Current signature, if any
    pub fn signature(&self) -> Option<Vec<u8>> {
        self.credentials().map(|c| c.signature().to_vec())
    }
}

impl CredentialSource for Settings {
    fn credentials(&self) -> Option<Arc<Credentials>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
