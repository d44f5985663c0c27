//! Password-derived cryptography.
//!
//! This module provides:
//! - One-shot hashing (SHA-256, SHA-512)
//! - Key derivation from a password (SHA-512 of the UTF-8 bytes)
//! - HMAC-SHA512 signing, used to build the "password is correct" signature
//! - AES-256-CBC streaming cipher with PKCS#7 padding
//!
//! Digest, signer and cipher share one life cycle (`update` any number of
//! times, then `finalize` once), expressed by the `StreamingTransform` trait.
//!
//! The cipher uses a zero IV. Two files encrypted under the same password
//! therefore share ciphertext prefixes when their plaintext prefixes match.

use std::fmt;

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256Dec, Aes256Enc, Block as AesBlock};
use hmac::{Hmac, Mac};
use sha2::{Digest as Sha2Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::CryptoError;

type HmacSha512 = Hmac<Sha512>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes (taken from the front of the derived key)
pub const KEY_SIZE: usize = 32;

/// Length of an HMAC-SHA512 tag, i.e. of the signature prefix in encrypted files
pub const SIGNATURE_SIZE: usize = 64;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    /// SHA-256 (32-byte digest)
    Sha256,
    /// SHA-512 (64-byte digest)
    #[default]
    Sha512,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

impl HashAlgorithm {
    /// Digest length in bytes
    pub fn output_size(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

/// Direction of a cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

/// Shared "update then finalize" life cycle of digests, signers and ciphers.
///
/// `update` may return fewer or more bytes than it was given (ciphers buffer
/// partial blocks; digests and signers return nothing until the end).
/// `finalize` may be called once; afterwards the transform is inert and every
/// call fails with a backend error.
pub trait StreamingTransform: Send {
    /// Feed a chunk. An empty chunk is a no-op.
    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Flush buffered state and return the trailing output.
    fn finalize(&mut self) -> Result<Vec<u8>, CryptoError>;
}

/// Run a whole buffer through a transform: one `update`, then `finalize`.
pub fn transform_all(
    transform: &mut dyn StreamingTransform,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut output = transform.update(data)?;
    output.extend_from_slice(&transform.finalize()?);
    Ok(output)
}

fn already_finalized() -> CryptoError {
    CryptoError::backend("transform already finalized")
}

// Digest

enum DigestState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Streaming hash
pub struct Digest {
    state: Option<DigestState>,
}

impl Digest {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => DigestState::Sha256(<Sha256 as Sha2Digest>::new()),
            HashAlgorithm::Sha512 => DigestState::Sha512(<Sha512 as Sha2Digest>::new()),
        };
        Digest { state: Some(state) }
    }
}

impl StreamingTransform for Digest {
    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.state.as_mut() {
            Some(DigestState::Sha256(hasher)) => Sha2Digest::update(hasher, data),
            Some(DigestState::Sha512(hasher)) => Sha2Digest::update(hasher, data),
            None => return Err(already_finalized()),
        }
        Ok(Vec::new())
    }

    fn finalize(&mut self) -> Result<Vec<u8>, CryptoError> {
        match self.state.take() {
            Some(DigestState::Sha256(hasher)) => Ok(Sha2Digest::finalize(hasher).to_vec()),
            Some(DigestState::Sha512(hasher)) => Ok(Sha2Digest::finalize(hasher).to_vec()),
            None => Err(already_finalized()),
        }
    }
}

// Signer

/// Streaming HMAC-SHA512 keyed by the password-derived key
pub struct Signer {
    mac: Option<HmacSha512>,
}

impl StreamingTransform for Signer {
    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mac = self.mac.as_mut().ok_or_else(already_finalized)?;
        Mac::update(mac, data);
        Ok(Vec::new())
    }

    fn finalize(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mac = self.mac.take().ok_or_else(already_finalized)?;
        Ok(Mac::finalize(mac).into_bytes().to_vec())
    }
}

// Cipher

enum BlockCipher {
    Encrypt(Aes256Enc),
    Decrypt(Aes256Dec),
}

struct CbcState {
    cipher: BlockCipher,
    chain: [u8; BLOCK_SIZE],
    pending: Vec<u8>,
}

fn cbc_encrypt(cipher: &Aes256Enc, chain: &mut [u8; BLOCK_SIZE], plain: &[u8]) {
    let mut input = [0u8; BLOCK_SIZE];
    for (i, byte) in input.iter_mut().enumerate() {
        *byte = plain[i] ^ chain[i];
    }
    let mut block = AesBlock::from(input);
    cipher.encrypt_block(&mut block);
    chain.copy_from_slice(block.as_ref());
}

fn cbc_decrypt(
    cipher: &Aes256Dec,
    chain: &mut [u8; BLOCK_SIZE],
    encrypted: &[u8],
) -> [u8; BLOCK_SIZE] {
    let mut block = AesBlock::clone_from_slice(encrypted);
    cipher.decrypt_block(&mut block);
    let mut plain = [0u8; BLOCK_SIZE];
    for (i, byte) in plain.iter_mut().enumerate() {
        *byte = block[i] ^ chain[i];
    }
    chain.copy_from_slice(encrypted);
    plain
}

impl CbcState {
    /// Transform `len` leading bytes of the pending buffer (a multiple of the block size).
    fn process_pending(&mut self, len: usize) -> Vec<u8> {
        let CbcState {
            cipher,
            chain,
            pending,
        } = self;

        let mut output = Vec::with_capacity(len);
        for block in pending[..len].chunks_exact(BLOCK_SIZE) {
            match cipher {
                BlockCipher::Encrypt(cipher) => {
                    cbc_encrypt(cipher, chain, block);
                    output.extend_from_slice(&chain[..]);
                }
                BlockCipher::Decrypt(cipher) => {
                    output.extend_from_slice(&cbc_decrypt(cipher, chain, block));
                }
            }
        }
        pending.drain(..len);
        output
    }
}

/// AES-256-CBC stream with PKCS#7 padding.
///
/// On decrypt the last full block is always held back until `finalize`,
/// because it carries the padding.
pub struct Cipher {
    mode: CipherMode,
    state: Option<CbcState>,
}

impl Cipher {
    fn new(key: &[u8], mode: CipherMode) -> Result<Self, CryptoError> {
        let key = key
            .get(..KEY_SIZE)
            .ok_or_else(|| CryptoError::backend("invalid key length"))?;
        let cipher = match mode {
            CipherMode::Encrypt => BlockCipher::Encrypt(
                Aes256Enc::new_from_slice(key).map_err(|e| CryptoError::backend(e.to_string()))?,
            ),
            CipherMode::Decrypt => BlockCipher::Decrypt(
                Aes256Dec::new_from_slice(key).map_err(|e| CryptoError::backend(e.to_string()))?,
            ),
        };
        Ok(Cipher {
            mode,
            state: Some(CbcState {
                cipher,
                chain: [0u8; BLOCK_SIZE],
                pending: Vec::with_capacity(2 * BLOCK_SIZE),
            }),
        })
    }
}

impl StreamingTransform for Cipher {
    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let state = self.state.as_mut().ok_or_else(already_finalized)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }

        state.pending.extend_from_slice(data);
        let mut ready = state.pending.len() - state.pending.len() % BLOCK_SIZE;
        if self.mode == CipherMode::Decrypt && ready == state.pending.len() {
            ready = ready.saturating_sub(BLOCK_SIZE);
        }

        Ok(state.process_pending(ready))
    }

    fn finalize(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut state = self.state.take().ok_or_else(already_finalized)?;

        match self.mode {
            CipherMode::Encrypt => {
                let pad = BLOCK_SIZE - state.pending.len();
                state.pending.resize(BLOCK_SIZE, pad as u8);
                Ok(state.process_pending(BLOCK_SIZE))
            }
            CipherMode::Decrypt => {
                if state.pending.len() != BLOCK_SIZE {
                    return Err(CryptoError::backend("wrong final block length"));
                }
                let mut plain = state.process_pending(BLOCK_SIZE);
                let pad = plain[BLOCK_SIZE - 1] as usize;
                if pad == 0
                    || pad > BLOCK_SIZE
                    || plain[BLOCK_SIZE - pad..].iter().any(|&b| b as usize != pad)
                {
                    return Err(CryptoError::backend("bad decrypt"));
                }
                plain.truncate(BLOCK_SIZE - pad);
                Ok(plain)
            }
        }
    }
}

// Engine entry points

/// One-shot digest. Empty input yields empty output.
pub fn hash(data: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>, CryptoError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut digest = create_digest(algorithm);
    digest.update(data)?;
    digest.finalize()
}

/// Derive the symmetric key: SHA-512 of the UTF-8 password.
pub fn derive_key(password: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::empty_password());
    }

    Ok(Zeroizing::new(hash(password.as_bytes(), HashAlgorithm::Sha512)?))
}

/// HMAC-SHA512 of `message` keyed by the password-derived key.
///
/// An empty message yields an empty signature (after the password check).
pub fn sign(message: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    let mut signer = create_signer(password)?;
    if message.is_empty() {
        return Ok(Vec::new());
    }

    signer.update(message)?;
    signer.finalize()
}

/// Encrypt a whole buffer. Empty input yields empty output.
pub fn encrypt(data: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    let mut cipher = open_cipher(password, CipherMode::Encrypt)?;
    if data.is_empty() {
        return Ok(Vec::new());
    }
    transform_all(&mut cipher, data)
}

/// Decrypt a whole buffer. Empty input yields empty output.
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    let mut cipher = open_cipher(password, CipherMode::Decrypt)?;
    if data.is_empty() {
        return Ok(Vec::new());
    }
    transform_all(&mut cipher, data)
}

/// Create a streaming digest
pub fn create_digest(algorithm: HashAlgorithm) -> Digest {
    Digest::new(algorithm)
}

/// Create a streaming signer keyed by `password`
pub fn create_signer(password: &str) -> Result<Signer, CryptoError> {
    let key = derive_key(password)?;
    let mac = <HmacSha512 as Mac>::new_from_slice(&key)
        .map_err(|e| CryptoError::backend(e.to_string()))?;
    Ok(Signer { mac: Some(mac) })
}

/// Open a streaming cipher keyed by `password`
pub fn open_cipher(password: &str, mode: CipherMode) -> Result<Cipher, CryptoError> {
    let key = derive_key(password)?;
    Cipher::new(&key, mode)
}
