//! AES-256-GCM credential vault with Argon2id key derivation.
//!
//! Secret fields of a data-source auth config (API keys, passwords, bearer
//! tokens, client secrets) are stored encrypted and only decrypted in memory
//! when a connector is constructed. Each value is encrypted separately with a
//! unique nonce.
//!
//! # Key handling
//! The symmetric key is derived once per process from an externally supplied
//! master secret using Argon2id with a fixed application salt. The derivation
//! is deliberately slow (memory- and CPU-hard) so a leaked derived key cannot
//! be trivially recomputed from the secret alone. The derived key lives in
//! memory only and is never written anywhere.
//!
//! # Wire format
//! `encrypt` returns a single opaque string: `base64(nonce ‖ ciphertext ‖ tag)`.
//! The 12-byte nonce is a length prefix of the decoded buffer; the GCM tag is
//! appended to the ciphertext by the cipher itself.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the derived encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Fixed application salt for key derivation. Not secret — its job is to
/// domain-separate this derivation from any other use of the same secret.
const KDF_SALT: &[u8] = b"portico.credential-vault.v1";

/// Vault errors. Callers match on these: a `Decryption` error means tamper,
/// corruption, or wrong key — never "value was not encrypted".
#[derive(Debug, Clone, PartialEq)]
pub enum VaultError {
    /// Master secret missing or empty (fatal configuration error)
    MissingSecret,
    /// Key derivation failed
    KeyDerivation(String),
    /// Encryption failed
    Encryption(String),
    /// Authentication tag did not verify, or the payload is malformed
    Decryption(String),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultError::MissingSecret => {
                write!(f, "Master secret for credential vault is not configured")
            }
            VaultError::KeyDerivation(e) => write!(f, "Key derivation failed: {}", e),
            VaultError::Encryption(e) => write!(f, "Encryption failed: {}", e),
            VaultError::Decryption(e) => {
                write!(f, "Decryption failed (wrong key or corrupted data): {}", e)
            }
        }
    }
}

impl std::error::Error for VaultError {}

/// Authenticated encryption/decryption of secret strings.
///
/// One instance per process; the Argon2id derivation runs once in `new`.
/// `encrypt`/`decrypt` are pure CPU work with no I/O.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Derives the symmetric key from `master_secret` and builds the cipher.
    ///
    /// # Errors
    /// * `VaultError::MissingSecret` - secret is empty
    /// * `VaultError::KeyDerivation` - Argon2 rejected the parameters
    pub fn new(master_secret: &str) -> Result<Self, VaultError> {
        if master_secret.is_empty() {
            return Err(VaultError::MissingSecret);
        }

        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(master_secret.as_bytes(), KDF_SALT, &mut key)
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

        Ok(Self { cipher })
    }

    /// Encrypts plaintext with a fresh random nonce (never reused).
    ///
    /// Returns `base64(nonce ‖ ciphertext ‖ tag)` as one opaque string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        // Random nonce per call — reuse would be a catastrophic
        // confidentiality loss for this key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(payload))
    }

    /// Decrypts an opaque string produced by `encrypt`.
    ///
    /// # Errors
    /// * `VaultError::Decryption` - invalid base64, truncated payload, or the
    ///   authentication tag does not verify (tamper or wrong key)
    pub fn decrypt(&self, opaque: &str) -> Result<String, VaultError> {
        let payload = BASE64
            .decode(opaque)
            .map_err(|e| VaultError::Decryption(format!("invalid base64: {}", e)))?;

        if payload.len() <= NONCE_SIZE {
            return Err(VaultError::Decryption(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Decryption("plaintext is not valid UTF-8".to_string()))
    }
}
