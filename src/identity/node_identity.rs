use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey, Signature};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{MeshError, Result};
use super::keystore::Keystore;

/// Opaque, prefixed unique node identifier (`node_` + 22 base32 chars, in the
/// style of every other prefixed id this codebase mints). Stable for the
/// lifetime of the on-disk identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    const PREFIX: &'static str = "node_";

    fn generate() -> Self {
        let mut bytes = [0u8; 16];
        use rand::RngCore;
        OsRng.fill_bytes(&mut bytes);
        let encoded = base32_encode(&bytes);
        Self(format!("{}{}", Self::PREFIX, encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_string(s: String) -> Result<Self> {
        if !s.starts_with(Self::PREFIX) || s.len() <= Self::PREFIX.len() {
            return Err(MeshError::InvalidArgument(format!("not a valid node id: {s}")));
        }
        Ok(Self(s))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cheap, stable 64-bit id used for deterministic hashing / tie-breaking in
/// routing (§4.3 "lower destination routing_id wins").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingId(pub u64);

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn base32_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity((bytes.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &b in bytes {
        buffer = (buffer << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn routing_id_from_public_key(pk: &[u8; 32]) -> RoutingId {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(pk);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    RoutingId(u64::from_be_bytes(buf))
}

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

struct SigningMaterial {
    signing_key: SigningKey,
}

/// The node's persistent identity: id, keypair, routing id, and version.
/// `LocalIdentity()` never fails once constructed (§4.1 contract) — all
/// fallibility lives in `load_or_create`/`rotate`.
pub struct LocalIdentity {
    node_id: NodeId,
    routing_id: RwLock<RoutingId>,
    material: RwLock<SigningMaterial>,
    version: String,
}

impl LocalIdentity {
    pub fn load_or_create(data_dir: &Path, passphrase: &[u8]) -> Result<Self> {
        let keystore = Keystore::open(data_dir, passphrase)?;

        if let Some(record) = keystore.load_identity()? {
            let signing_key = SigningKey::from_bytes(&record.secret_key);
            let verifying = signing_key.verifying_key();
            let routing_id = routing_id_from_public_key(&verifying.to_bytes());
            return Ok(Self {
                node_id: NodeId::from_string(record.node_id)?,
                routing_id: RwLock::new(routing_id),
                material: RwLock::new(SigningMaterial { signing_key }),
                version: CRATE_VERSION.to_string(),
            });
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying = signing_key.verifying_key();
        let node_id = NodeId::generate();
        let routing_id = routing_id_from_public_key(&verifying.to_bytes());

        keystore.persist_identity(node_id.as_str(), &signing_key.to_bytes())?;

        Ok(Self {
            node_id,
            routing_id: RwLock::new(routing_id),
            material: RwLock::new(SigningMaterial { signing_key }),
            version: CRATE_VERSION.to_string(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn routing_id(&self) -> RoutingId {
        *self.routing_id.read().unwrap()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.material.read().unwrap().signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, bytes: &[u8]) -> [u8; 64] {
        self.material.read().unwrap().signing_key.sign(bytes).to_bytes()
    }

    pub fn verify(public_key: &[u8; 32], bytes: &[u8], signature: &[u8; 64]) -> Result<()> {
        let verifying = VerifyingKey::from_bytes(public_key)
            .map_err(|e| MeshError::AuthRejected(format!("bad public key: {e}")))?;
        let sig = Signature::from_bytes(signature);
        verifying
            .verify(bytes, &sig)
            .map_err(|e| MeshError::AuthRejected(format!("signature verification failed: {e}")))
    }

    pub fn rotate(&self, data_dir: &Path, passphrase: &[u8]) -> Result<[u8; 32]> {
        let keystore = Keystore::open(data_dir, passphrase)?;
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying = signing_key.verifying_key();
        let new_routing_id = routing_id_from_public_key(&verifying.to_bytes());

        keystore.persist_identity(self.node_id.as_str(), &signing_key.to_bytes())?;

        let mut material = self.material.write().unwrap();
        material.signing_key = signing_key;
        *self.routing_id.write().unwrap() = new_routing_id;

        Ok(verifying.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reload_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = LocalIdentity::load_or_create(dir.path(), b"pw").unwrap();
        let node_id = id1.node_id().clone();
        let pubkey = id1.public_key_bytes();
        drop(id1);

        let id2 = LocalIdentity::load_or_create(dir.path(), b"pw").unwrap();
        assert_eq!(id2.node_id(), &node_id);
        assert_eq!(id2.public_key_bytes(), pubkey);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let id = LocalIdentity::load_or_create(dir.path(), b"pw").unwrap();
        let msg = b"hello mesh";
        let sig = id.sign(msg);
        let pubkey = id.public_key_bytes();
        LocalIdentity::verify(&pubkey, msg, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let dir = tempfile::tempdir().unwrap();
        let id = LocalIdentity::load_or_create(dir.path(), b"pw").unwrap();
        let sig = id.sign(b"hello mesh");
        let pubkey = id.public_key_bytes();
        assert!(LocalIdentity::verify(&pubkey, b"hello mess", &sig).is_err());
    }

    #[test]
    fn rotate_changes_public_key_but_not_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let id = LocalIdentity::load_or_create(dir.path(), b"pw").unwrap();
        let node_id = id.node_id().clone();
        let old_pubkey = id.public_key_bytes();
        let new_pubkey = id.rotate(dir.path(), b"pw").unwrap();
        assert_eq!(id.node_id(), &node_id);
        assert_ne!(old_pubkey, new_pubkey);
    }
}
