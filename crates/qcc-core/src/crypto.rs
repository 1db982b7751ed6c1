//! Collaborator boundary for two opaque external primitives: an
//! Ed25519-variant signature scheme (`schnorrq.verify`) and the
//! `KangarooTwelve` extendable-output hash (`crypto.K12`).
//!
//! Both are trait objects so a real binding (e.g. to an FFI `schnorrq`
//! implementation) can be swapped in without touching the Sync Tracker or
//! the transfer pipeline. The default implementations here are concrete
//! stand-ins: Ed25519 via `ed25519-dalek`, KangarooTwelve via
//! `tiny-keccak`.

use ed25519_dalek::Verifier;
use tiny_keccak::Hasher;

/// Verifies a signature produced by the admin/identity signing scheme.
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` iff `signature` is a valid signature by `public_key`
    /// over `message`. Never panics on malformed input — returns `false`.
    fn verify(&self, public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool;
}

/// Extendable-output hash used wherever the collaborator interface calls
/// `crypto.K12(input, output, outLen, outOffset)`.
pub trait ExtendableOutputHash: Send + Sync {
    fn hash_into(&self, input: &[u8], output: &mut [u8]);
}

/// Ed25519 stand-in for the network's `schnorrq` primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
        let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(sig_bytes): Result<[u8; 64], _> = signature.try_into() else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        vk.verify(message, &sig).is_ok()
    }
}

/// KangarooTwelve stand-in backed by `tiny-keccak`.
#[derive(Debug, Default, Clone, Copy)]
pub struct K12Hasher;

impl ExtendableOutputHash for K12Hasher {
    fn hash_into(&self, input: &[u8], output: &mut [u8]) {
        let mut k12 = tiny_keccak::KangarooTwelve::new(&[]);
        k12.update(input);
        k12.finalize(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_round_trip() {
        use ed25519_dalek::{Signer, SigningKey};
        let sk = SigningKey::from_bytes(&[7u8; 32]);
        let vk = sk.verifying_key();
        let msg = b"epoch+tick payload";
        let sig = sk.sign(msg);
        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&vk.to_bytes(), msg, &sig.to_bytes()));
        assert!(!verifier.verify(&vk.to_bytes(), b"tampered", &sig.to_bytes()));
    }

    #[test]
    fn k12_is_deterministic() {
        let hasher = K12Hasher;
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hasher.hash_into(b"hello", &mut a);
        hasher.hash_into(b"hello", &mut b);
        assert_eq!(a, b);
        let mut c = [0u8; 32];
        hasher.hash_into(b"world", &mut c);
        assert_ne!(a, c);
    }
}
