use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::VartimeMultiscalarMul;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::PartyId;
use crate::Error;

/// Secret polynomial f of degree t, with f(0) the dealt secret. A receiver's
/// share is the evaluation f(id) at its identity.
#[derive(Clone, Zeroize)]
pub struct SecretPolynomial {
    coefficients: Vec<Scalar>,
}

impl SecretPolynomial {
    pub fn random(secret: Scalar, t: u16, rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let mut coefficients = Vec::with_capacity(usize::from(t) + 1);
        coefficients.push(secret);
        for _ in 0..t {
            coefficients.push(Scalar::random(rng));
        }
        SecretPolynomial { coefficients }
    }

    /// Horner evaluation. Scalar arithmetic over the coefficients is
    /// constant-time; only the public evaluation point varies.
    pub fn evaluate(&self, id: PartyId) -> Scalar {
        let x = Scalar::from(u64::from(id.get()));
        let mut acc = Scalar::ZERO;
        for coefficient in self.coefficients.iter().rev() {
            acc = acc * x + coefficient;
        }
        acc
    }

    /// Feldman commitment C_k = f_k G for every coefficient.
    pub fn commit(&self) -> VerifiableSS {
        VerifiableSS {
            commitments: self
                .coefficients
                .iter()
                .map(EdwardsPoint::mul_base)
                .collect(),
        }
    }
}

impl Drop for SecretPolynomial {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Public commitment to a secret polynomial.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableSS {
    pub commitments: Vec<EdwardsPoint>,
}

impl VerifiableSS {
    pub fn threshold(&self) -> u16 {
        (self.commitments.len() - 1) as u16
    }

    /// The committed contribution f(0) G.
    pub fn constant_term(&self) -> &EdwardsPoint {
        &self.commitments[0]
    }

    /// Public evaluation sum_k id^k C_k of the committed polynomial.
    pub fn evaluate_exponent(&self, id: PartyId) -> EdwardsPoint {
        let x = Scalar::from(u64::from(id.get()));
        let mut powers = Vec::with_capacity(self.commitments.len());
        let mut power = Scalar::ONE;
        for _ in 0..self.commitments.len() {
            powers.push(power);
            power *= x;
        }
        EdwardsPoint::vartime_multiscalar_mul(powers.iter(), self.commitments.iter())
    }

    /// Feldman check: share G must equal the public evaluation at `id`.
    pub fn validate_share(&self, share: &Scalar, id: PartyId) -> Result<(), Error> {
        if EdwardsPoint::mul_base(share) == self.evaluate_exponent(id) {
            Ok(())
        } else {
            Err(Error::KeyGenInvalidShare)
        }
    }
}

/// Lagrange coefficient lambda_i(0) over the evaluation points `ids`.
///
/// Multiplying each share by its coefficient and summing over any t+1 of the
/// `ids` reconstructs f(0) (here always used in the exponent or against the
/// local share only).
pub fn lagrange_coefficient(ids: &[PartyId], i: PartyId) -> Result<Scalar, Error> {
    let xi = Scalar::from(u64::from(i.get()));
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    let mut member = false;

    for &j in ids {
        if j == i {
            member = true;
            continue;
        }
        let xj = Scalar::from(u64::from(j.get()));
        numerator *= xj;
        denominator *= xj - xi;
    }

    if !member || denominator == Scalar::ZERO {
        return Err(Error::InvalidPeerSet);
    }
    Ok(numerator * denominator.invert())
}
