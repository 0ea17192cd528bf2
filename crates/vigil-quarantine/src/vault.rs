//! Encrypted blob format for quarantined files.
//!
//! Envelope scheme: every blob gets a fresh 256-bit content key and nonce;
//! the payload is sealed with ChaCha20-Poly1305 under the content key, and
//! the content key itself is sealed under the store master key with a
//! nonce derived from the blob nonce. Opening verifies the magic, version,
//! and both authentication tags; any mismatch is an
//! [`IntegrityFailure`](VigilError::IntegrityFailure) and no plaintext is
//! returned.
//!
//! ## On-Disk Layout
//!
//! ```text
//! ┌───────────┬────────────┬────────────┬───────────────┬─────────────┬──────────────┐
//! │ magic     │ version    │ nonce      │ wrapped key   │ orig size   │ ciphertext   │
//! │ "QVLT" 4B │ u32 LE  4B │ 12B        │ 48B (32+tag)  │ u64 LE  8B  │ rest         │
//! └───────────┴────────────┴────────────┴───────────────┴─────────────┴──────────────┘
//! ```

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use vigil_core::{Result, VigilError};

/// Blob magic bytes.
pub const MAGIC: [u8; 4] = *b"QVLT";

/// Current format version.
pub const VERSION: u32 = 1;

const NONCE_LEN: usize = 12;
const WRAPPED_KEY_LEN: usize = 32 + 16;
const HEADER_LEN: usize = 4 + 4 + NONCE_LEN + WRAPPED_KEY_LEN + 8;

/// Store-level key wrapping every per-blob content key.
///
/// Provisioning is out-of-band; the store only ever sees the raw bytes.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps existing key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Loads the key from a file, creating and persisting a fresh one when
    /// the file does not exist.
    pub fn load_or_create(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path).map_err(|e| VigilError::io(path, e))?;
            let bytes: [u8; 32] = bytes.try_into().map_err(|_| VigilError::IntegrityFailure {
                subject: path.display().to_string(),
                detail: "master key file is not 32 bytes".into(),
            })?;
            return Ok(Self(bytes));
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VigilError::io(parent, e))?;
        }
        std::fs::write(path, key.0).map_err(|e| VigilError::io(path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(key)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.write_str("MasterKey(..)")
    }
}

/// Seals plaintext into the blob format.
pub fn seal(master: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut content_key = [0u8; 32];
    OsRng.fill_bytes(&mut content_key);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let content_cipher = ChaCha20Poly1305::new(Key::from_slice(&content_key));
    let ciphertext = content_cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| seal_failure("payload encryption failed"))?;

    let master_cipher = ChaCha20Poly1305::new(Key::from_slice(&master.0));
    let wrap_nonce = derive_wrap_nonce(&nonce);
    let wrapped_key = master_cipher
        .encrypt(Nonce::from_slice(&wrap_nonce), content_key.as_slice())
        .map_err(|_| seal_failure("key wrap failed"))?;
    debug_assert_eq!(wrapped_key.len(), WRAPPED_KEY_LEN);

    let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    blob.extend_from_slice(&MAGIC);
    blob.extend_from_slice(&VERSION.to_le_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&wrapped_key);
    blob.extend_from_slice(&(plaintext.len() as u64).to_le_bytes());
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Opens a blob, returning the plaintext.
///
/// # Errors
///
/// [`VigilError::IntegrityFailure`] on wrong magic, unsupported version,
/// truncation, or a failed authentication tag.
pub fn open(master: &MasterKey, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < HEADER_LEN {
        return Err(integrity_failure("blob truncated"));
    }
    if blob[..4] != MAGIC {
        return Err(integrity_failure("bad magic"));
    }
    let version = u32::from_le_bytes(blob[4..8].try_into().expect("fixed slice"));
    if version != VERSION {
        return Err(integrity_failure(&format!("unsupported version {version}")));
    }

    let nonce_end = 8 + NONCE_LEN;
    let key_end = nonce_end + WRAPPED_KEY_LEN;
    let nonce = Nonce::from_slice(&blob[8..nonce_end]);
    let wrapped_key = &blob[nonce_end..key_end];
    let original_size =
        u64::from_le_bytes(blob[key_end..HEADER_LEN].try_into().expect("fixed slice"));
    let ciphertext = &blob[HEADER_LEN..];

    let master_cipher = ChaCha20Poly1305::new(Key::from_slice(&master.0));
    let wrap_nonce = derive_wrap_nonce(nonce);
    let content_key = master_cipher
        .decrypt(Nonce::from_slice(&wrap_nonce), wrapped_key)
        .map_err(|_| integrity_failure("key unwrap failed"))?;

    let content_cipher = ChaCha20Poly1305::new(Key::from_slice(&content_key));
    let plaintext = content_cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| integrity_failure("authentication tag mismatch"))?;

    if plaintext.len() as u64 != original_size {
        return Err(integrity_failure("size field disagrees with payload"));
    }
    Ok(plaintext)
}

/// The key-wrap nonce is the blob nonce under a fixed domain-separation
/// mask, so the two AEAD invocations never share a (key, nonce) pair.
fn derive_wrap_nonce(nonce: &Nonce) -> [u8; NONCE_LEN] {
    let mut wrap = [0u8; NONCE_LEN];
    wrap.copy_from_slice(nonce);
    for byte in &mut wrap {
        *byte ^= 0xA5;
    }
    wrap
}

fn integrity_failure(detail: &str) -> VigilError {
    VigilError::IntegrityFailure {
        subject: "quarantine blob".into(),
        detail: detail.into(),
    }
}

fn seal_failure(detail: &str) -> VigilError {
    VigilError::IntegrityFailure {
        subject: "quarantine blob".into(),
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let master = MasterKey::generate();
        let plaintext = b"quarantined payload bytes";
        let blob = seal(&master, plaintext).unwrap();
        assert_eq!(&blob[..4], b"QVLT");
        assert_eq!(open(&master, &blob).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let master = MasterKey::generate();
        let blob = seal(&master, b"").unwrap();
        assert!(open(&master, &blob).unwrap().is_empty());
    }

    #[test]
    fn test_one_byte_tamper_fails_integrity() {
        let master = MasterKey::generate();
        let blob = seal(&master, b"payload under test").unwrap();

        for index in [8, HEADER_LEN - 1, HEADER_LEN, blob.len() - 1] {
            let mut tampered = blob.clone();
            tampered[index] ^= 0x01;
            let err = open(&master, &tampered).unwrap_err();
            assert!(
                matches!(err, VigilError::IntegrityFailure { .. }),
                "offset {index} should fail integrity, got {err}"
            );
        }
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let master = MasterKey::generate();
        let mut blob = seal(&master, b"x").unwrap();
        blob[0] = b'X';
        let err = open(&master, &blob).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_wrong_master_key_rejected() {
        let blob = seal(&MasterKey::generate(), b"secret").unwrap();
        let err = open(&MasterKey::generate(), &blob).unwrap_err();
        assert!(matches!(err, VigilError::IntegrityFailure { .. }));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let master = MasterKey::generate();
        let blob = seal(&master, b"x").unwrap();
        let err = open(&master, &blob[..HEADER_LEN - 2]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_distinct_blobs_for_same_plaintext() {
        let master = MasterKey::generate();
        let a = seal(&master, b"same input").unwrap();
        let b = seal(&master, b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_master_key_load_or_create_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keys").join("master.key");

        let first = MasterKey::load_or_create(&path).unwrap();
        let second = MasterKey::load_or_create(&path).unwrap();

        let blob = seal(&first, b"check").unwrap();
        assert_eq!(open(&second, &blob).unwrap(), b"check");
    }
}
