// Encrypted local keystore for the node's long-term signing key.
//
// Envelope shape adapted from the teacher's master/data key hierarchy
// (security_vault/keystore.rs): here there is only one secret (the Ed25519
// signing key) so the hierarchy collapses to a single wrapping key derived
// from an operator-supplied passphrase via Argon2id, used to AES-256-GCM
// seal the signing key at rest.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::password_hash::SaltString;
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{MeshError, Result};

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt keystore record: {0}")]
    Corrupt(String),
    #[error("wrong passphrase or tampered keystore")]
    DecryptionFailed,
}

impl From<KeystoreError> for MeshError {
    fn from(e: KeystoreError) -> Self {
        MeshError::Configuration(e.to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct EncryptedRecord {
    node_id: String,
    salt: String,
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

pub struct DecryptedIdentity {
    pub node_id: String,
    pub secret_key: [u8; 32],
}

/// Opens (or will create, on first `persist_identity`) `<data_dir>/identity.key`.
pub struct Keystore {
    path: PathBuf,
    passphrase: Vec<u8>,
}

impl Keystore {
    pub fn open(data_dir: &Path, passphrase: &[u8]) -> Result<Self> {
        fs::create_dir_all(data_dir).map_err(KeystoreError::Io)?;
        Ok(Self {
            path: data_dir.join("identity.key"),
            passphrase: passphrase.to_vec(),
        })
    }

    pub fn load_identity(&self) -> Result<Option<DecryptedIdentity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).map_err(KeystoreError::Io)?;
        let record: EncryptedRecord = serde_json::from_slice(&data)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;

        let salt = SaltString::from_b64(&record.salt)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;
        let wrapping_key = derive_wrapping_key(&self.passphrase, salt.as_str().as_bytes())?;

        let cipher = Aes256Gcm::new_from_slice(&wrapping_key)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&record.nonce), record.ciphertext.as_ref())
            .map_err(|_| KeystoreError::DecryptionFailed)?;

        if plaintext.len() != 32 {
            return Err(KeystoreError::Corrupt("secret key has wrong length".into()).into());
        }
        let mut secret_key = [0u8; 32];
        secret_key.copy_from_slice(&plaintext);

        Ok(Some(DecryptedIdentity { node_id: record.node_id, secret_key }))
    }

    pub fn persist_identity(&self, node_id: &str, secret_key: &[u8; 32]) -> Result<()> {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let wrapping_key = derive_wrapping_key(&self.passphrase, salt.as_str().as_bytes())?;

        let cipher = Aes256Gcm::new_from_slice(&wrapping_key)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;

        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret_key.as_ref())
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;

        let record = EncryptedRecord {
            node_id: node_id.to_string(),
            salt: salt.as_str().to_string(),
            nonce: nonce_bytes,
            ciphertext,
        };

        let bytes = serde_json::to_vec(&record)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;
        fs::write(&self.path, bytes).map_err(KeystoreError::Io)?;
        Ok(())
    }
}

fn derive_wrapping_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase, salt, &mut out)
        .map_err(|e| KeystoreError::Corrupt(format!("key derivation failed: {e}")))?;
    Ok(out)
}
