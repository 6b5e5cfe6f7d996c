//! Password-protected on-disk persistence for the root CA material. The
//! file holds the root certificate and the encrypted private key; the
//! certificate is not secret and is stored in the clear so it can be
//! inspected/exported for trust-store installation without the password.
//!
//! Format (binary, all fields length-prefixed as little-endian u32):
//! `[cert_pem_len][cert_pem][salt(16)][nonce(12)][ciphertext+tag]`
//!
//! The private key PEM is the plaintext that gets encrypted. The key used
//! to encrypt it is derived from the caller's password via PBKDF2-HMAC-
//! SHA256 (a fresh random salt per file) and used as an AES-256-GCM key
//! (a fresh random nonce per file).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::io::Write as _;
use std::path::Path;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 200_000;

#[derive(Debug)]
pub struct StorageError(pub String);

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ca storage error: {}", self.0)
    }
}

impl std::error::Error for StorageError {}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt `key_pem` with `password` and write `[cert_pem, encrypted key]`
/// atomically (write-to-temp, then rename) to `path`.
pub fn save(path: &Path, cert_pem: &str, key_pem: &str, password: &str) -> Result<(), StorageError> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key_material = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_material));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, key_pem.as_bytes())
        .map_err(|e| StorageError(format!("encrypt failed: {e}")))?;

    let mut out = Vec::new();
    let cert_bytes = cert_pem.as_bytes();
    out.extend_from_slice(&(cert_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(cert_bytes);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| StorageError(format!("create {}: {e}", tmp_path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
        }
        file.write_all(&out)
            .map_err(|e| StorageError(format!("write {}: {e}", tmp_path.display())))?;
        file.sync_all().ok();
    }
    std::fs::rename(&tmp_path, path)
        .map_err(|e| StorageError(format!("rename into {}: {e}", path.display())))?;
    Ok(())
}

/// Decrypt and load `(cert_pem, key_pem)` from `path` using `password`.
pub fn load(path: &Path, password: &str) -> Result<(String, String), StorageError> {
    let raw = std::fs::read(path)
        .map_err(|e| StorageError(format!("read {}: {e}", path.display())))?;
    if raw.len() < 4 {
        return Err(StorageError("truncated CA file".to_string()));
    }
    let cert_len = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
    let rest = &raw[4..];
    if rest.len() < cert_len + SALT_LEN + NONCE_LEN {
        return Err(StorageError("truncated CA file".to_string()));
    }
    let cert_pem = std::str::from_utf8(&rest[..cert_len])
        .map_err(|_| StorageError("non-utf8 cert PEM".to_string()))?
        .to_string();
    let salt = &rest[cert_len..cert_len + SALT_LEN];
    let nonce_bytes = &rest[cert_len + SALT_LEN..cert_len + SALT_LEN + NONCE_LEN];
    let ciphertext = &rest[cert_len + SALT_LEN + NONCE_LEN..];

    let key_material = derive_key(password, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_material));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| StorageError("decryption failed (wrong password?)".to_string()))?;
    let key_pem = String::from_utf8(plaintext)
        .map_err(|_| StorageError("non-utf8 key PEM".to_string()))?;

    Ok((cert_pem, key_pem))
}
