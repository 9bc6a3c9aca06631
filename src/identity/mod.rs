// Identity & Keystore (L1)
//
// Persistent per-node Ed25519 keypair, stable node id / routing id
// derivation, and the Sign/Verify contract L2 and L4 depend on.

mod keystore;
mod node_identity;

pub use keystore::{Keystore, KeystoreError};
pub use node_identity::{LocalIdentity, NodeId, RoutingId};

use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Top-level identity handle a `Runtime` owns. Wraps the keystore so callers
/// never see key material directly.
#[derive(Clone)]
pub struct IdentityService {
    inner: Arc<LocalIdentity>,
}

impl IdentityService {
    /// Load the persisted identity from `data_dir`, generating one at first
    /// boot if none exists. `passphrase` wraps the private key at rest.
    pub fn open(data_dir: &Path, passphrase: &[u8]) -> Result<Self> {
        let identity = LocalIdentity::load_or_create(data_dir, passphrase)?;
        Ok(Self { inner: Arc::new(identity) })
    }

    pub fn node_id(&self) -> &NodeId {
        self.inner.node_id()
    }

    pub fn routing_id(&self) -> RoutingId {
        self.inner.routing_id()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.inner.public_key_bytes()
    }

    pub fn version(&self) -> &str {
        self.inner.version()
    }

    /// Sign an arbitrary byte string with the node's long-term key.
    pub fn sign(&self, bytes: &[u8]) -> [u8; 64] {
        self.inner.sign(bytes)
    }

    /// Verify a signature against a known peer public key (not this node's).
    pub fn verify(public_key: &[u8; 32], bytes: &[u8], signature: &[u8; 64]) -> Result<()> {
        LocalIdentity::verify(public_key, bytes, signature)
    }

    /// Rotate the signing key. The new public key must be propagated through
    /// the MCG by the caller; the old key remains valid for verification
    /// until that membership entry is committed everywhere (§4.1).
    pub fn rotate(&self, data_dir: &Path, passphrase: &[u8]) -> Result<[u8; 32]> {
        self.inner.rotate(data_dir, passphrase)
    }
}
