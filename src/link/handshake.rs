// Link handshake (§4.2): both sides exchange node id, a signed nonce,
// incarnation, and software version over the HELLO/HELLO_ACK frames before
// any DATA/RAFT frame is accepted. Adapted from the teacher's
// Handshake/HandshakeRequest shape, generalized to carry a signature instead
// of a bearer token and to check membership instead of a cluster-name string.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};
use crate::identity::{IdentityService, NodeId};

pub const SUPPORTED_LINK_VERSION: u16 = 1;
pub const MIN_LINK_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Hello {
    pub link_version: u16,
    pub node_id: String,
    pub routing_id: u64,
    pub incarnation: u64,
    pub software_version: String,
    pub nonce: [u8; 16],
    pub signature: [u8; 64],
}

impl Hello {
    /// Builds and signs a HELLO for this node. The signed bytes are
    /// `node_id || routing_id || incarnation || nonce`, binding the nonce to
    /// the sender's identity so it cannot be replayed by another node.
    pub fn new(identity: &IdentityService, incarnation: u64) -> Self {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let node_id = identity.node_id().as_str().to_string();
        let routing_id = identity.routing_id().0;

        let mut signed = Vec::with_capacity(node_id.len() + 8 + 8 + 16);
        signed.extend_from_slice(node_id.as_bytes());
        signed.extend_from_slice(&routing_id.to_be_bytes());
        signed.extend_from_slice(&incarnation.to_be_bytes());
        signed.extend_from_slice(&nonce);

        let signature = identity.sign(&signed);

        Self {
            link_version: SUPPORTED_LINK_VERSION,
            node_id,
            routing_id,
            incarnation,
            software_version: identity.version().to_string(),
            nonce,
            signature,
        }
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut signed = Vec::with_capacity(self.node_id.len() + 8 + 8 + 16);
        signed.extend_from_slice(self.node_id.as_bytes());
        signed.extend_from_slice(&self.routing_id.to_be_bytes());
        signed.extend_from_slice(&self.incarnation.to_be_bytes());
        signed.extend_from_slice(&self.nonce);
        signed
    }

    /// Validates protocol version and signature against a known peer public
    /// key. Membership-view checks (is this node id currently a member) are
    /// the caller's responsibility since this module has no topology access.
    pub fn validate(&self, peer_public_key: &[u8; 32]) -> Result<()> {
        if self.link_version < MIN_LINK_VERSION {
            return Err(MeshError::AuthRejected(format!(
                "unsupported link version {}",
                self.link_version
            )));
        }
        let signed = self.signed_bytes();
        IdentityService::verify(peer_public_key, &signed, &self.signature)
    }

    pub fn node_id(&self) -> Result<NodeId> {
        NodeId::from_string(self.node_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HelloAck {
    pub accepted: bool,
    pub negotiated_version: u16,
    pub node_id: String,
    pub routing_id: u64,
    pub reject_reason: Option<String>,
}

impl HelloAck {
    pub fn accepted(identity: &IdentityService, peer_version: u16) -> Self {
        Self {
            accepted: true,
            negotiated_version: SUPPORTED_LINK_VERSION.min(peer_version),
            node_id: identity.node_id().as_str().to_string(),
            routing_id: identity.routing_id().0,
            reject_reason: None,
        }
    }

    pub fn rejected(identity: &IdentityService, reason: String) -> Self {
        Self {
            accepted: false,
            negotiated_version: 0,
            node_id: identity.node_id().as_str().to_string(),
            routing_id: identity.routing_id().0,
            reject_reason: Some(reason),
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.accepted {
            Ok(())
        } else {
            Err(MeshError::AuthRejected(
                self.reject_reason.unwrap_or_else(|| "rejected".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hello_signature_validates_against_sender_public_key() {
        let dir = tempdir().unwrap();
        let identity = IdentityService::open(dir.path(), b"pw").unwrap();
        let hello = Hello::new(&identity, 1);
        let pubkey = identity.public_key_bytes();
        assert!(hello.validate(&pubkey).is_ok());
    }

    #[test]
    fn hello_signature_rejects_wrong_key() {
        let dir1 = tempdir().unwrap();
        let dir2 = tempdir().unwrap();
        let identity1 = IdentityService::open(dir1.path(), b"pw").unwrap();
        let identity2 = IdentityService::open(dir2.path(), b"pw").unwrap();
        let hello = Hello::new(&identity1, 1);
        assert!(hello.validate(&identity2.public_key_bytes()).is_err());
    }
}
