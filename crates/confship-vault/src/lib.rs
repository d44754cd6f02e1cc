//! Encrypted credential vault for deployment passwords.
//!
//! Hosts that require a sudo or login password reference a vault entry by
//! endpoint name. The vault file on disk is an AES-256-GCM ciphertext of a
//! JSON object mapping endpoint names to passwords, with the key derived
//! from a passphrase via PBKDF2. Consumers only ever see resolved
//! passwords through [`Vault::lookup`]; the cryptography stays in here.
//!
//! ## On-disk format
//!
//! `base64(salt || nonce || ciphertext || auth_tag)` — 16-byte salt,
//! 12-byte nonce, PBKDF2-HMAC-SHA256 with 100,000 iterations.
//!
//! ## Usage
//!
//! ```
//! use confship_vault::Vault;
//!
//! let mut vault = Vault::new();
//! vault.insert("web01", "hunter2");
//! let blob = vault.seal("master-passphrase").expect("seal");
//!
//! let reopened = Vault::open_blob(&blob, "master-passphrase").expect("open");
//! assert_eq!(reopened.lookup("web01"), Some("hunter2"));
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

/// Size of the salt for key derivation (16 bytes)
const SALT_SIZE: usize = 16;
/// Size of the nonce for AES-GCM (12 bytes)
const NONCE_SIZE: usize = 12;
/// Number of PBKDF2 iterations
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Size of the derived key (256 bits for AES-256)
const KEY_SIZE: usize = 32;

/// A decrypted credential store: endpoint name -> password.
#[derive(Debug, Default, Clone)]
pub struct Vault {
    entries: BTreeMap<String, String>,
}

impl Vault {
    /// Create an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decrypt a vault file with the given passphrase.
    pub fn open(path: &Path, passphrase: &str) -> Result<Self> {
        let blob = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read vault file {}", path.display()))?;
        Self::open_blob(blob.trim(), passphrase)
            .with_context(|| format!("failed to open vault {}", path.display()))
    }

    /// Decrypt an in-memory vault blob.
    pub fn open_blob(blob: &str, passphrase: &str) -> Result<Self> {
        let plaintext = decrypt(blob, passphrase)?;
        let entries: BTreeMap<String, String> =
            serde_json::from_slice(&plaintext).context("vault payload is not a JSON object")?;
        Ok(Self { entries })
    }

    /// Look up the password for an endpoint name.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, name: impl Into<String>, password: impl Into<String>) {
        self.entries.insert(name.into(), password.into());
    }

    /// Remove an entry, returning whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Endpoint names present in the vault, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Encrypt the vault into its on-disk blob form.
    pub fn seal(&self, passphrase: &str) -> Result<String> {
        let payload = serde_json::to_vec(&self.entries).context("failed to serialize vault")?;
        encrypt(&payload, passphrase)
    }

    /// Encrypt and write the vault to disk.
    pub fn save(&self, path: &Path, passphrase: &str) -> Result<()> {
        let blob = self.seal(passphrase)?;
        std::fs::write(path, blob)
            .with_context(|| format!("failed to write vault file {}", path.display()))?;
        Ok(())
    }
}

/// Encrypt data using AES-256-GCM with PBKDF2 key derivation.
///
/// Returns the base64-encoded `salt || nonce || ciphertext` blob.
fn encrypt(data: &[u8], passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to create AES-256-GCM cipher")?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| anyhow::anyhow!("encryption failed: {:?}", e))?;

    let mut result = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&salt);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&result))
}

/// Decrypt a base64 `salt || nonce || ciphertext` blob.
fn decrypt(blob: &str, passphrase: &str) -> Result<Vec<u8>> {
    let data = BASE64.decode(blob).context("invalid base64 encoding")?;

    if data.len() < SALT_SIZE + NONCE_SIZE + 16 {
        bail!("encrypted vault data too short");
    }

    let salt = &data[..SALT_SIZE];
    let nonce_bytes = &data[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to create AES-256-GCM cipher")?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher.decrypt(nonce, ciphertext).map_err(|e| {
        anyhow::anyhow!(
            "vault decryption failed - wrong passphrase or corrupted data: {:?}",
            e
        )
    })
}

/// Derive a 256-bit key from passphrase using PBKDF2-SHA256.
fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}
