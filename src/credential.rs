//! Unsafe-mode credential gate (C16): an scrypt-hashed password record, checked
//! with a constant-time comparison before any [`crate::adaptations::WriteMode::Unsafe`]
//! write is permitted.
//!
//! This module owns reading/writing the credential record's *bytes*; where that
//! file lives is an explicit path supplied by the caller -- interactive
//! password prompting and config-directory resolution are both frontend concerns.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use scrypt::Params;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// `log2(n)` cost parameter this crate hashes new passwords with (`n = 2^14`).
pub const SCRYPT_LOG_N: u8 = 14;
/// Block size parameter.
pub const SCRYPT_R: u32 = 8;
/// Parallelization parameter.
pub const SCRYPT_P: u32 = 1;
/// Derived key length, in bytes.
pub const DK_LEN: usize = 32;
/// Salt length, in bytes.
pub const SALT_LEN: usize = 16;

/// A persisted scrypt password hash. `n`/`r`/`p`/`dklen` are stored
/// alongside the hash rather than assumed, so an older record hashed under
/// different parameters still verifies correctly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Base64 (standard alphabet, padded) salt.
    pub salt_b64: String,
    /// Scrypt cost parameter `N` (a power of two, e.g. `16384`).
    pub n: u32,
    /// Scrypt block size parameter `r`.
    pub r: u32,
    /// Scrypt parallelization parameter `p`.
    pub p: u32,
    /// Derived key length, in bytes.
    pub dklen: usize,
    /// Base64 (standard alphabet, padded) derived key.
    pub hash_b64: String,
}

/// Errors raised while hashing or verifying a password.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The scrypt cost parameters were invalid (e.g. `n` not a power of two).
    #[error("invalid scrypt parameters: {0}")]
    InvalidParams(String),
    /// A record's `salt_b64`/`hash_b64` field was not valid base64.
    #[error("credential record contained invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    /// The underlying scrypt computation failed.
    #[error("scrypt hashing failed")]
    HashFailed,
    /// The record file could not be read or written.
    #[error("credential record I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The record file existed but was not valid JSON.
    #[error("invalid credential record: {0}")]
    InvalidRecord(#[from] serde_json::Error),
}

/// Hashes `password` under a freshly-generated random salt and this crate's
/// standard cost parameters.
pub fn hash_password(password: &str) -> Result<CredentialRecord, CredentialError> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, DK_LEN)
        .map_err(|e| CredentialError::InvalidParams(e.to_string()))?;
    let mut output = [0u8; DK_LEN];
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut output).map_err(|_| CredentialError::HashFailed)?;
    Ok(CredentialRecord {
        salt_b64: STANDARD.encode(salt),
        n: 1u32 << SCRYPT_LOG_N,
        r: SCRYPT_R,
        p: SCRYPT_P,
        dklen: DK_LEN,
        hash_b64: STANDARD.encode(output),
    })
}

/// Checks `password` against `record`, rehashing under the record's own stored
/// parameters and comparing in constant time. Never short-circuits on
/// which byte differs; only the up-front length check (an inherent property of
/// any fixed-size digest comparison) is not constant-time.
pub fn verify_password(password: &str, record: &CredentialRecord) -> Result<bool, CredentialError> {
    if !record.n.is_power_of_two() {
        return Err(CredentialError::InvalidParams(format!(
            "n must be a power of two, got {}",
            record.n
        )));
    }
    let log_n = record.n.trailing_zeros() as u8;
    let params = Params::new(log_n, record.r, record.p, record.dklen)
        .map_err(|e| CredentialError::InvalidParams(e.to_string()))?;

    let salt = STANDARD.decode(&record.salt_b64)?;
    let expected = STANDARD.decode(&record.hash_b64)?;

    let mut actual = vec![0u8; record.dklen];
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut actual).map_err(|_| CredentialError::HashFailed)?;

    Ok(bool::from(actual.ct_eq(&expected)))
}

/// Loads a persisted [`CredentialRecord`] from `path`.
pub fn load_record(path: &Path) -> Result<CredentialRecord, CredentialError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Persists `record` to `path` as pretty-printed JSON, creating the parent
/// directory if necessary.
pub fn save_record(path: &Path, record: &CredentialRecord) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(record)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_password_uses_the_standard_cost_parameters() {
        let record = hash_password("correct horse battery staple").unwrap();
        assert_eq!(record.n, 16384);
        assert_eq!(record.r, SCRYPT_R);
        assert_eq!(record.p, SCRYPT_P);
        assert_eq!(record.dklen, DK_LEN);
        let salt = STANDARD.decode(&record.salt_b64).unwrap();
        assert_eq!(salt.len(), SALT_LEN);
    }

    #[test]
    fn verify_accepts_the_correct_password() {
        let record = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &record).unwrap());
    }

    #[test]
    fn verify_rejects_the_wrong_password() {
        let record = hash_password("hunter2").unwrap();
        assert!(!verify_password("hunter3", &record).unwrap());
    }

    #[test]
    fn two_hashes_of_the_same_password_use_different_salts() {
        let a = hash_password("hunter2").unwrap();
        let b = hash_password("hunter2").unwrap();
        assert_ne!(a.salt_b64, b.salt_b64);
        assert_ne!(a.hash_b64, b.hash_b64);
    }

    #[test]
    fn save_then_load_round_trips_and_still_verifies() {
        let dir = std::env::temp_dir().join(format!("uds_diag_core_cred_{}", std::process::id()));
        let path = dir.join("password.json");
        let record = hash_password("hunter2").unwrap();
        save_record(&path, &record).unwrap();
        let loaded = load_record(&path).unwrap();
        assert_eq!(loaded, record);
        assert!(verify_password("hunter2", &loaded).unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join("uds_diag_core_cred_missing_does_not_exist.json");
        assert!(matches!(load_record(&path), Err(CredentialError::Io(_))));
    }
}
