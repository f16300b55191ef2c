use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use super::PartyId;
use crate::Error;

/// Hiding commitment over `parts`: SHA-512(parts || blind) truncated to
/// 32 bytes. The construction is fixed; peers re-derive it bit-for-bit.
pub fn hash_commitment(parts: &[&[u8]], blind: &[u8; 32]) -> [u8; 32] {
    let mut h = Sha512::new();
    for part in parts {
        h.update(part);
    }
    h.update(blind);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.finalize()[..32]);
    out
}

/// NIZK proof of knowledge of the discrete log of a public point, bound to
/// the prover's identity so one party's proof cannot be replayed as another's.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlogProof {
    pub commitment: EdwardsPoint,
    pub response: Scalar,
}

impl DlogProof {
    pub fn prove(
        witness: &Scalar,
        statement: &EdwardsPoint,
        prover: PartyId,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> DlogProof {
        let mut v = Scalar::random(rng);
        let commitment = EdwardsPoint::mul_base(&v);
        let e = Self::challenge(statement, &commitment, prover);
        let response = v + e * witness;
        v.zeroize();
        DlogProof {
            commitment,
            response,
        }
    }

    pub fn verify(&self, statement: &EdwardsPoint, prover: PartyId) -> bool {
        let e = Self::challenge(statement, &self.commitment, prover);
        EdwardsPoint::mul_base(&self.response) == self.commitment + statement * e
    }

    fn challenge(statement: &EdwardsPoint, commitment: &EdwardsPoint, prover: PartyId) -> Scalar {
        let h = Sha512::new()
            .chain_update(statement.compress().as_bytes())
            .chain_update(commitment.compress().as_bytes())
            .chain_update(prover.get().to_be_bytes());
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&h.finalize());
        Scalar::from_bytes_mod_order_wide(&wide)
    }
}

/// Decode a curve point arriving at a trust boundary (wire or share blob):
/// canonical encoding, on-curve, not the identity, torsion-free.
pub fn decode_point(bytes: &[u8; 32]) -> Result<EdwardsPoint, Error> {
    let compressed = CompressedEdwardsY(*bytes);
    let point = compressed.decompress().ok_or(Error::InvalidPoint)?;
    if point.compress() != compressed {
        return Err(Error::InvalidPoint);
    }
    if point.is_identity() || !point.is_torsion_free() {
        return Err(Error::InvalidPoint);
    }
    Ok(point)
}

/// Decode a canonical little-endian scalar.
pub fn decode_scalar(bytes: &[u8; 32]) -> Result<Scalar, Error> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(Error::InvalidScalar)
}
