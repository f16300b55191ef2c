#![allow(non_snake_case)]

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::Error;

/// Schnorr-style Ed25519 over an explicit scalar key, per [https://tools.ietf.org/html/rfc8032].
/// The threshold protocol emits exactly this signature shape, so the
/// challenge and verification logic here are shared with it.

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub A: EdwardsPoint,
    x: Scalar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EddsaSignature {
    pub R: EdwardsPoint,
    pub s: Scalar,
}

impl KeyPair {
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let x = Scalar::random(rng);
        let A = EdwardsPoint::mul_base(&x);
        KeyPair { A, x }
    }

    // sigma = (R, r + H(R || A || m) x)
    pub fn sign(&self, digest: &[u8; 32], rng: &mut (impl RngCore + CryptoRng)) -> EddsaSignature {
        let mut r = Scalar::random(rng);
        let R = EdwardsPoint::mul_base(&r);
        let s = r + challenge(&R, &self.A, digest) * self.x;
        r.zeroize();
        EddsaSignature { R, s }
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

/// The per-signature scalar c = SHA-512(R || A || digest) mod L.
pub fn challenge(R: &EdwardsPoint, A: &EdwardsPoint, digest: &[u8; 32]) -> Scalar {
    let h = Sha512::new()
        .chain_update(R.compress().as_bytes())
        .chain_update(A.compress().as_bytes())
        .chain_update(digest);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&h.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

impl EddsaSignature {
    // check s G == R + H(R || A || m) A against the reference verifier
    pub fn verify(&self, digest: &[u8; 32], pubkey: &EdwardsPoint) -> bool {
        let key = match ed25519_dalek::VerifyingKey::from_bytes(pubkey.compress().as_bytes()) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = ed25519_dalek::Signature::from_bytes(&self.to_bytes());
        key.verify_strict(digest, &signature).is_ok()
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(self.R.compress().as_bytes());
        out[32..].copy_from_slice(&self.s.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self, Error> {
        let mut R_bytes = [0u8; 32];
        R_bytes.copy_from_slice(&bytes[..32]);
        let R = CompressedEdwardsY(R_bytes)
            .decompress()
            .ok_or(Error::InvalidPoint)?;
        if R.compress().to_bytes() != R_bytes {
            return Err(Error::InvalidPoint);
        }

        let mut s_bytes = [0u8; 32];
        s_bytes.copy_from_slice(&bytes[32..]);
        let s: Option<Scalar> = Scalar::from_canonical_bytes(s_bytes).into();

        Ok(EddsaSignature {
            R,
            s: s.ok_or(Error::InvalidScalar)?,
        })
    }
}

mod test {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    pub fn test_simple_eddsa() {
        let mut rng = rand::rngs::OsRng;
        let keypair = KeyPair::generate(&mut rng);
        let digest = [7u8; 32];
        let signature = keypair.sign(&digest, &mut rng);
        assert!(signature.verify(&digest, &keypair.A));
    }

    #[test]
    #[should_panic]
    pub fn test_bad_simple_eddsa() {
        let mut rng = rand::rngs::OsRng;
        let keypair = KeyPair::generate(&mut rng);
        let digest = [7u8; 32];
        let signature = keypair.sign(&digest, &mut rng);
        let digest_corrupt = [8u8; 32];
        assert!(signature.verify(&digest_corrupt, &keypair.A));
    }

    #[test]
    pub fn test_signature_roundtrip() {
        let mut rng = rand::rngs::OsRng;
        let keypair = KeyPair::generate(&mut rng);
        let digest = [3u8; 32];
        let signature = keypair.sign(&digest, &mut rng);
        let restored = EddsaSignature::from_bytes(&signature.to_bytes()).unwrap();
        assert_eq!(signature, restored);
        assert!(restored.verify(&digest, &keypair.A));
    }

    #[test]
    pub fn we_recognize_signatures_generated_by_ref_impl() {
        use ed25519_dalek::Signer;

        let key = ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]);
        let digest = [5u8; 32];
        let signature = key.sign(&digest);

        let parsed = EddsaSignature::from_bytes(&signature.to_bytes()).unwrap();
        let pubkey = CompressedEdwardsY(key.verifying_key().to_bytes())
            .decompress()
            .unwrap();
        assert!(parsed.verify(&digest, &pubkey));
    }
}
