//! Transfer pipeline collaborator: the core only specifies the interface
//! it consumes — identity derivation from a seed and the exact transfer
//! byte layout are out of scope. A minimal reference implementation is
//! provided so `qcc-cli` has something concrete to wire up; real
//! deployments can swap it for a binding to the network's actual transfer
//! format.

use async_trait::async_trait;
use ed25519_dalek::Signer;

use crate::crypto::ExtendableOutputHash;
use crate::error::{Error, Result};
use crate::wire::MessageDigest;

pub struct TransferRequest {
    pub signing_key: ed25519_dalek::SigningKey,
    pub index: u64,
    pub sender_identity: String,
    pub identity_nonce: u64,
    pub energy: u64,
    pub recipient_identity: String,
    pub effect_payload: Vec<u8>,
    /// Domain validation input: the cost the effect payload requires.
    pub required_energy: u64,
}

#[derive(Debug, Clone)]
pub struct TransferDraft {
    pub message_digest: MessageDigest,
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait TransferBuilder: Send + Sync {
    async fn build(&self, req: TransferRequest) -> Result<TransferDraft>;
}

/// Reference transfer builder: concatenates the request fields into a
/// fixed-layout message, signs it, and derives the digest with the K12
/// collaborator. Domain errors (insufficient energy) are raised before
/// any signing or network activity.
pub struct ReferenceTransferBuilder {
    hasher: Box<dyn ExtendableOutputHash>,
}

impl ReferenceTransferBuilder {
    pub fn new(hasher: Box<dyn ExtendableOutputHash>) -> Self {
        Self { hasher }
    }

    fn layout(req: &TransferRequest) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + req.effect_payload.len());
        buf.extend_from_slice(req.sender_identity.as_bytes());
        buf.extend_from_slice(&req.identity_nonce.to_be_bytes());
        buf.extend_from_slice(&req.energy.to_be_bytes());
        buf.extend_from_slice(req.recipient_identity.as_bytes());
        buf.extend_from_slice(&req.effect_payload);
        buf
    }
}

#[async_trait]
impl TransferBuilder for ReferenceTransferBuilder {
    async fn build(&self, req: TransferRequest) -> Result<TransferDraft> {
        if req.energy < req.required_energy {
            return Err(Error::Domain(format!(
                "insufficient energy: have {}, need {}",
                req.energy, req.required_energy
            )));
        }

        let message = Self::layout(&req);
        let signature = req.signing_key.sign(&message).to_bytes().to_vec();

        let mut digest = [0u8; 32];
        self.hasher.hash_into(&message, &mut digest);

        Ok(TransferDraft {
            message_digest: MessageDigest(digest),
            message,
            signature,
        })
    }
}
