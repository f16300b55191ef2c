#![allow(non_snake_case)]

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::{Identity, IsIdentity};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::basic_eddsa::{challenge, EddsaSignature};
use crate::threshold_eddsa::utilities::{hash_commitment, DlogProof};
use crate::threshold_eddsa::vss::{lagrange_coefficient, SecretPolynomial, VerifiableSS};
use crate::threshold_eddsa::{PartyId, PeerSet};
use crate::Error;

/// The keygen is a dealer-less Feldman VSS in commit-then-open form. Every
/// party deals a random degree-t polynomial; the joint secret is the sum of
/// all constant terms and nobody ever reconstructs it. Hash-committing the
/// polynomial commitments before opening them keeps a rushing adversary from
/// biasing the group key, and a Schnorr proof of knowledge of the dealt
/// contribution rules out rogue-key style cancellation.
///
/// Signing follows the classic three-move nonce commit/reveal/respond shape.
/// The aggregated signature is a plain Ed25519 signature under the group key:
/// the challenge is the standard SHA-512(R || A || digest) scalar, so any
/// RFC 8032 verifier accepts the output.

/// Ephemeral keygen state of one party: its contribution to the joint secret
/// and the polynomial sharing it.
pub struct Keys {
    pub party_id: PartyId,
    u_i: Scalar,
    poly: SecretPolynomial,
    vss: VerifiableSS,
    blind: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenCommit {
    pub com: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyGenOpen {
    pub vss: VerifiableSS,
    pub blind: [u8; 32],
    pub pok: DlogProof,
}

/// A point-to-point share f_i(j), dealt by party i to party j.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretShareMsg {
    pub share: Scalar,
}

impl Drop for SecretShareMsg {
    fn drop(&mut self) {
        self.share.zeroize();
    }
}

/// Long-term secret state of one party after keygen.
#[derive(Clone, Serialize, Deserialize)]
pub struct SharedKeys {
    pub i: PartyId,
    pub group: EdwardsPoint,
    pub x_i: Scalar,
}

impl Drop for SharedKeys {
    fn drop(&mut self) {
        self.x_i.zeroize();
    }
}

fn commitment_digest(vss: &VerifiableSS, who: PartyId, blind: &[u8; 32]) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(vss.commitments.len() * 32);
    for commitment in &vss.commitments {
        encoded.extend_from_slice(commitment.compress().as_bytes());
    }
    // the sender identity contextualizes the hash
    hash_commitment(&[&encoded, &who.get().to_be_bytes()], blind)
}

impl Keys {
    pub fn phase1_create(party_id: PartyId, t: u16, rng: &mut (impl RngCore + CryptoRng)) -> Keys {
        let u = Scalar::random(rng);
        let poly = SecretPolynomial::random(u, t, rng);
        let vss = poly.commit();
        let mut blind = [0u8; 32];
        rng.fill_bytes(&mut blind);

        Keys {
            party_id,
            u_i: u,
            poly,
            vss,
            blind,
        }
    }

    pub fn phase1_broadcast(&self) -> KeyGenCommit {
        KeyGenCommit {
            com: commitment_digest(&self.vss, self.party_id, &self.blind),
        }
    }

    pub fn phase2_opening(&self, rng: &mut (impl RngCore + CryptoRng)) -> KeyGenOpen {
        KeyGenOpen {
            vss: self.vss.clone(),
            blind: self.blind,
            pok: DlogProof::prove(&self.u_i, self.vss.constant_term(), self.party_id, rng),
        }
    }

    pub fn phase2_share_for(&self, peer: PartyId) -> SecretShareMsg {
        SecretShareMsg {
            share: self.poly.evaluate(peer),
        }
    }

    /// Check one peer's opening against its round-1 hash commitment.
    pub fn phase2_verify_opening(
        open: &KeyGenOpen,
        commit: &KeyGenCommit,
        who: PartyId,
        t: u16,
    ) -> Result<(), Error> {
        if open.vss.threshold() != t {
            return Err(Error::KeyGenMismatchedVectors);
        }
        if commitment_digest(&open.vss, who, &open.blind) != commit.com {
            return Err(Error::KeyGenBadCommitment);
        }
        if !open.pok.verify(open.vss.constant_term(), who) {
            return Err(Error::KeyGenBadProofOfKnowledge);
        }
        Ok(())
    }

    /// The standard Feldman check of a share dealt to us.
    pub fn phase3_verify_share(
        open: &KeyGenOpen,
        share: &SecretShareMsg,
        me: PartyId,
    ) -> Result<(), Error> {
        open.vss.validate_share(&share.share, me)
    }

    /// Sum the dealt shares and commitments into the local key, then
    /// cross-check the group invariants before emitting anything.
    pub fn phase3_finalize(
        &self,
        peers: &PeerSet,
        opens: &[KeyGenOpen],
        shares: &[SecretShareMsg],
    ) -> Result<(SharedKeys, Vec<EdwardsPoint>), Error> {
        if opens.len() != peers.len() || shares.len() != peers.len() {
            return Err(Error::KeyGenMismatchedVectors);
        }

        let x_i: Scalar = shares.iter().map(|s| s.share).sum();
        let group: EdwardsPoint = opens.iter().map(|o| *o.vss.constant_term()).sum();
        let vk_vec: Vec<EdwardsPoint> = peers
            .ids()
            .iter()
            .map(|&k| {
                opens
                    .iter()
                    .map(|o| o.vss.evaluate_exponent(k))
                    .sum::<EdwardsPoint>()
            })
            .collect();

        if group.is_identity() || vk_vec.iter().any(|vk| vk.is_identity()) {
            return Err(Error::KeyGenInconsistentKey);
        }

        let me = peers.position(self.party_id).ok_or(Error::InvalidPeerSet)?;
        if EdwardsPoint::mul_base(&x_i) != vk_vec[me] {
            return Err(Error::KeyGenInconsistentKey);
        }

        // interpolating the verification points over the full peer set must
        // land back on the group key
        let mut interpolated = EdwardsPoint::identity();
        for (pos, &k) in peers.ids().iter().enumerate() {
            interpolated += vk_vec[pos] * lagrange_coefficient(peers.ids(), k)?;
        }
        if interpolated != group {
            return Err(Error::KeyGenInconsistentKey);
        }

        Ok((
            SharedKeys {
                i: self.party_id,
                group,
                x_i,
            },
            vk_vec,
        ))
    }
}

impl Drop for Keys {
    fn drop(&mut self) {
        self.u_i.zeroize();
        self.blind.zeroize();
    }
}

// Signing

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceCommit {
    pub com: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NonceOpen {
    pub R_i: EdwardsPoint,
    pub salt: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub s_i: Scalar,
}

/// Per-session nonce. Lives only for the duration of one signing session.
pub struct EphemeralNonce {
    r: Scalar,
    pub R_i: EdwardsPoint,
    salt: [u8; 32],
}

impl Drop for EphemeralNonce {
    fn drop(&mut self) {
        self.r.zeroize();
        self.salt.zeroize();
    }
}

impl SharedKeys {
    /// Round 1: sample a fresh nonce and hash-commit to its public point.
    /// The commitment is SHA-512(R_i || salt_i) truncated to 32 bytes.
    pub fn round1_commit(
        rng: &mut (impl RngCore + CryptoRng),
    ) -> (EphemeralNonce, NonceCommit) {
        let r = Scalar::random(rng);
        let R_i = EdwardsPoint::mul_base(&r);
        let mut salt = [0u8; 32];
        rng.fill_bytes(&mut salt);
        let com = hash_commitment(&[R_i.compress().as_bytes()], &salt);

        (EphemeralNonce { r, R_i, salt }, NonceCommit { com })
    }

    /// Round 2: open the commitment.
    pub fn round2_open(nonce: &EphemeralNonce) -> NonceOpen {
        NonceOpen {
            R_i: nonce.R_i,
            salt: nonce.salt,
        }
    }

    pub fn round2_verify_opening(open: &NonceOpen, commit: &NonceCommit) -> Result<(), Error> {
        if open.R_i.is_identity() || !open.R_i.is_torsion_free() {
            return Err(Error::InvalidPoint);
        }
        if hash_commitment(&[open.R_i.compress().as_bytes()], &open.salt) != commit.com {
            return Err(Error::SignBadNonceCommitment);
        }
        Ok(())
    }

    /// Round 3: the partial response s_i = r_i + c lambda_i x_i.
    pub fn round3_partial_sign(
        &self,
        nonce: &EphemeralNonce,
        quorum: &PeerSet,
        digest: &[u8; 32],
        aggregated_nonce: &EdwardsPoint,
    ) -> Result<PartialSignature, Error> {
        let lambda = lagrange_coefficient(quorum.ids(), self.i)?;
        let c = challenge(aggregated_nonce, &self.group, digest);
        Ok(PartialSignature {
            s_i: nonce.r + c * lambda * self.x_i,
        })
    }

    /// Check one peer's response: s_j G == R_j + c lambda_j X_j.
    pub fn verify_partial(
        open: &NonceOpen,
        vk: &EdwardsPoint,
        c: &Scalar,
        lambda: &Scalar,
        partial: &PartialSignature,
    ) -> Result<(), Error> {
        if EdwardsPoint::mul_base(&partial.s_i) != open.R_i + vk * (c * lambda) {
            return Err(Error::SignInvalidPartialSignature);
        }
        Ok(())
    }

    /// Aggregate the quorum's responses and verify the result under the
    /// group key with the reference verifier.
    pub fn combine(
        &self,
        quorum: &PeerSet,
        digest: &[u8; 32],
        opens: &[NonceOpen],
        partials: &[PartialSignature],
    ) -> Result<EddsaSignature, Error> {
        if opens.len() != quorum.len() || partials.len() != quorum.len() {
            return Err(Error::SignMismatchedVectors);
        }

        let R: EdwardsPoint = opens.iter().map(|o| o.R_i).sum();
        let s: Scalar = partials.iter().map(|p| p.s_i).sum();
        let sigma = EddsaSignature { R, s };

        if !sigma.verify(digest, &self.group) {
            return Err(Error::SignInvalidSignature);
        }
        Ok(sigma)
    }
}
