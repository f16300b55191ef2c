use curve25519_dalek::edwards::EdwardsPoint;
use round_based::containers::{self, BroadcastMsgs, Store};
use round_based::Msg;
use thiserror::Error;

use super::M;
use crate::basic_eddsa::{challenge, EddsaSignature};
use crate::threshold_eddsa::party_i::{
    EphemeralNonce, NonceCommit, NonceOpen, PartialSignature, SharedKeys,
};
use crate::threshold_eddsa::state_machine::keygen::LocalKey;
use crate::threshold_eddsa::vss::lagrange_coefficient;
use crate::threshold_eddsa::{PartyId, PeerSet};

pub struct Round0 {
    pub key: LocalKey,
    pub quorum: PeerSet,
    pub digest: [u8; 32],
    pub i: u16,
}

impl Round0 {
    pub fn proceed(self, output: &mut Vec<Msg<M>>) -> Result<Round1> {
        let mut rng = rand::rngs::OsRng;
        let (nonce, comm) = SharedKeys::round1_commit(&mut rng);
        output.push(Msg {
            sender: self.i,
            receiver: None,
            body: M::Round1(comm.clone()),
        });
        Ok(Round1 {
            key: self.key,
            quorum: self.quorum,
            digest: self.digest,
            i: self.i,
            nonce,
            comm,
        })
    }
    pub fn is_expensive(&self) -> bool {
        true
    }
}

pub struct Round1 {
    key: LocalKey,
    quorum: PeerSet,
    digest: [u8; 32],
    i: u16,

    nonce: EphemeralNonce,
    comm: NonceCommit,
}

impl Round1 {
    pub fn proceed(
        self,
        input: BroadcastMsgs<NonceCommit>,
        output: &mut Vec<Msg<M>>,
    ) -> Result<Round2> {
        let received_comm = input.into_vec_including_me(self.comm);

        let own_open = SharedKeys::round2_open(&self.nonce);
        output.push(Msg {
            sender: self.i,
            receiver: None,
            body: M::Round2(own_open.clone()),
        });

        Ok(Round2 {
            key: self.key,
            quorum: self.quorum,
            digest: self.digest,
            i: self.i,
            nonce: self.nonce,
            received_comm,
            own_open,
        })
    }
    pub fn is_expensive(&self) -> bool {
        false
    }
    pub fn expects_messages(i: u16, n: u16) -> Store<BroadcastMsgs<NonceCommit>> {
        containers::BroadcastMsgsStore::new(i, n)
    }
}

pub struct Round2 {
    key: LocalKey,
    quorum: PeerSet,
    digest: [u8; 32],
    i: u16,

    nonce: EphemeralNonce,
    received_comm: Vec<NonceCommit>,
    own_open: NonceOpen,
}

impl Round2 {
    pub fn proceed(
        self,
        input: BroadcastMsgs<NonceOpen>,
        output: &mut Vec<Msg<M>>,
    ) -> Result<Round3> {
        let received_open = input.into_vec_including_me(self.own_open);

        for (pos, (open, comm)) in received_open.iter().zip(&self.received_comm).enumerate() {
            let who = self.quorum.id_at(pos);
            SharedKeys::round2_verify_opening(open, comm)
                .map_err(|error| ProceedError::Round2VerifyNonce { party: who, error })?;
        }

        let aggregated_nonce: EdwardsPoint = received_open.iter().map(|o| o.R_i).sum();
        let own_partial = self
            .key
            .shared_keys
            .round3_partial_sign(&self.nonce, &self.quorum, &self.digest, &aggregated_nonce)
            .map_err(ProceedError::Round3PartialSign)?;

        output.push(Msg {
            sender: self.i,
            receiver: None,
            body: M::Round3(own_partial.clone()),
        });

        // the nonce is consumed here; dropping it scrubs the scalar
        Ok(Round3 {
            key: self.key,
            quorum: self.quorum,
            digest: self.digest,
            received_open,
            aggregated_nonce,
            own_partial,
        })
    }
    pub fn is_expensive(&self) -> bool {
        true
    }
    pub fn expects_messages(i: u16, n: u16) -> Store<BroadcastMsgs<NonceOpen>> {
        containers::BroadcastMsgsStore::new(i, n)
    }
}

pub struct Round3 {
    key: LocalKey,
    quorum: PeerSet,
    digest: [u8; 32],

    received_open: Vec<NonceOpen>,
    aggregated_nonce: EdwardsPoint,
    own_partial: PartialSignature,
}

impl Round3 {
    pub fn proceed(self, input: BroadcastMsgs<PartialSignature>) -> Result<EddsaSignature> {
        let partials = input.into_vec_including_me(self.own_partial);

        let c = challenge(
            &self.aggregated_nonce,
            &self.key.shared_keys.group,
            &self.digest,
        );
        for (pos, (partial, open)) in partials.iter().zip(&self.received_open).enumerate() {
            let who = self.quorum.id_at(pos);
            let lambda = lagrange_coefficient(self.quorum.ids(), who)
                .map_err(ProceedError::FinalizeAggregate)?;
            let vk = self
                .key
                .verification_point(who)
                .ok_or(ProceedError::FinalizeAggregate(
                    crate::Error::SignMismatchedVectors,
                ))?;
            SharedKeys::verify_partial(open, vk, &c, &lambda, partial)
                .map_err(|error| ProceedError::Round3VerifyPartial { party: who, error })?;
        }

        self.key
            .shared_keys
            .combine(&self.quorum, &self.digest, &self.received_open, &partials)
            .map_err(ProceedError::FinalizeAggregate)
    }
    pub fn is_expensive(&self) -> bool {
        true
    }
    pub fn expects_messages(i: u16, n: u16) -> Store<BroadcastMsgs<PartialSignature>> {
        containers::BroadcastMsgsStore::new(i, n)
    }
}

// Errors

type Result<T, E = ProceedError> = std::result::Result<T, E>;

/// Proceeding protocol error
///
/// Subset of [signing errors](enum@super::Error) that can occur at protocol
/// proceeding (i.e. after every message was received and pre-validated).
#[derive(Debug, Error)]
pub enum ProceedError {
    #[error("round 2: nonce opening of party {party} doesn't match its commitment: {error:?}")]
    Round2VerifyNonce { party: PartyId, error: crate::Error },
    #[error("round 3: compute partial signature: {0:?}")]
    Round3PartialSign(crate::Error),
    #[error("round 3: partial signature of party {party} is invalid: {error:?}")]
    Round3VerifyPartial { party: PartyId, error: crate::Error },
    #[error("aggregate signature: {0:?}")]
    FinalizeAggregate(crate::Error),
}

impl ProceedError {
    /// The peer this error incriminates, when there is one.
    pub fn culprit(&self) -> Option<PartyId> {
        match self {
            ProceedError::Round2VerifyNonce { party, .. }
            | ProceedError::Round3VerifyPartial { party, .. } => Some(*party),
            ProceedError::Round3PartialSign(_) | ProceedError::FinalizeAggregate(_) => None,
        }
    }
}
