use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::traits::Identity;
use round_based::containers::{self, BroadcastMsgs, P2PMsgs, Store};
use round_based::Msg;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::M;
use crate::threshold_eddsa::party_i::{self, KeyGenCommit, KeyGenOpen, SecretShareMsg, SharedKeys};
use crate::threshold_eddsa::utilities::{decode_point, decode_scalar};
use crate::threshold_eddsa::vss::lagrange_coefficient;
use crate::threshold_eddsa::{PartyId, PeerSet};

pub struct Round0 {
    pub party_id: PartyId,
    pub peers: PeerSet,
    pub t: u16,
    pub i: u16,
}

impl Round0 {
    pub fn proceed(self, output: &mut Vec<Msg<M>>) -> Result<Round1> {
        let mut rng = rand::rngs::OsRng;
        let keys = party_i::Keys::phase1_create(self.party_id, self.t, &mut rng);
        let comm = keys.phase1_broadcast();
        output.push(Msg {
            sender: self.i,
            receiver: None,
            body: M::Round1(comm.clone()),
        });
        Ok(Round1 {
            keys,
            comm,
            peers: self.peers,
            t: self.t,
            i: self.i,
        })
    }
    pub fn is_expensive(&self) -> bool {
        true
    }
}

pub struct Round1 {
    keys: party_i::Keys,
    comm: KeyGenCommit,

    peers: PeerSet,
    t: u16,
    i: u16,
}

impl Round1 {
    pub fn proceed(
        self,
        input: BroadcastMsgs<KeyGenCommit>,
        output: &mut Vec<Msg<M>>,
    ) -> Result<Round2> {
        let received_comm = input.into_vec_including_me(self.comm);

        let mut rng = rand::rngs::OsRng;
        let own_open = self.keys.phase2_opening(&mut rng);
        output.push(Msg {
            sender: self.i,
            receiver: None,
            body: M::Round2(own_open.clone()),
        });

        for (pos, &peer) in self.peers.ids().iter().enumerate() {
            if pos + 1 == usize::from(self.i) {
                continue;
            }
            output.push(Msg {
                sender: self.i,
                receiver: Some(pos as u16 + 1),
                body: M::Round3(self.keys.phase2_share_for(peer)),
            });
        }
        let own_share = self.keys.phase2_share_for(self.keys.party_id);

        Ok(Round2 {
            keys: self.keys,
            received_comm,
            own_open,
            own_share,
            peers: self.peers,
            t: self.t,
        })
    }
    pub fn is_expensive(&self) -> bool {
        true
    }
    pub fn expects_messages(i: u16, n: u16) -> Store<BroadcastMsgs<KeyGenCommit>> {
        containers::BroadcastMsgsStore::new(i, n)
    }
}

pub struct Round2 {
    keys: party_i::Keys,
    received_comm: Vec<KeyGenCommit>,
    own_open: KeyGenOpen,
    own_share: SecretShareMsg,

    peers: PeerSet,
    t: u16,
}

impl Round2 {
    pub fn proceed(self, input: BroadcastMsgs<KeyGenOpen>) -> Result<Round3> {
        let received_open = input.into_vec_including_me(self.own_open);

        for (pos, (open, comm)) in received_open.iter().zip(&self.received_comm).enumerate() {
            let who = self.peers.id_at(pos);
            party_i::Keys::phase2_verify_opening(open, comm, who, self.t)
                .map_err(|error| ProceedError::Round2VerifyOpening { party: who, error })?;
        }

        Ok(Round3 {
            keys: self.keys,
            received_open,
            own_share: self.own_share,
            peers: self.peers,
        })
    }
    pub fn is_expensive(&self) -> bool {
        true
    }
    pub fn expects_messages(i: u16, n: u16) -> Store<BroadcastMsgs<KeyGenOpen>> {
        containers::BroadcastMsgsStore::new(i, n)
    }
}

pub struct Round3 {
    keys: party_i::Keys,
    received_open: Vec<KeyGenOpen>,
    own_share: SecretShareMsg,

    peers: PeerSet,
}

impl Round3 {
    pub fn proceed(self, input: P2PMsgs<SecretShareMsg>) -> Result<LocalKey> {
        let party_shares = input.into_vec_including_me(self.own_share);

        for (pos, (share, open)) in party_shares.iter().zip(&self.received_open).enumerate() {
            let dealer = self.peers.id_at(pos);
            party_i::Keys::phase3_verify_share(open, share, self.keys.party_id)
                .map_err(|error| ProceedError::Round3VerifyShare {
                    party: dealer,
                    error,
                })?;
        }

        let (shared_keys, vk_vec) = self
            .keys
            .phase3_finalize(&self.peers, &self.received_open, &party_shares)
            .map_err(ProceedError::Round3Finalize)?;

        Ok(LocalKey {
            shared_keys,
            vk_vec,
            peers: self.peers,
        })
    }
    pub fn is_expensive(&self) -> bool {
        true
    }
    pub fn expects_messages(i: u16, n: u16) -> Store<P2PMsgs<SecretShareMsg>> {
        containers::P2PMsgsStore::new(i, n)
    }
}

/// Local secret obtained by a party once [keygen](super::Keygen) completes.
///
/// Contains this party's long-term share of the group key, the group public
/// key, and every peer's public verification point. Persist it with
/// [`to_bytes`](LocalKey::to_bytes); it never crosses the transport.
#[derive(Clone, Serialize, Deserialize)]
pub struct LocalKey {
    pub(in crate::threshold_eddsa) shared_keys: SharedKeys,
    pub(in crate::threshold_eddsa) vk_vec: Vec<EdwardsPoint>,
    pub(in crate::threshold_eddsa) peers: PeerSet,
}

const SHARE_FORMAT_VERSION: u8 = 1;

impl LocalKey {
    /// Public key of the secret shared between the parties.
    pub fn public_key(&self) -> EdwardsPoint {
        self.shared_keys.group
    }

    pub fn id(&self) -> PartyId {
        self.shared_keys.i
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn verification_point(&self, id: PartyId) -> Option<&EdwardsPoint> {
        self.peers.position(id).map(|pos| &self.vk_vec[pos])
    }

    /// Opaque share blob: version, peer set, group key, secret share and the
    /// per-peer verification points. Round-trips through [`from_bytes`](LocalKey::from_bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.peers.len();
        let mut out = Vec::with_capacity(3 + 2 * n + 64 + 32 * n);
        out.push(SHARE_FORMAT_VERSION);
        out.extend_from_slice(&(n as u16).to_be_bytes());
        for id in self.peers.ids() {
            out.extend_from_slice(&id.get().to_be_bytes());
        }
        out.extend_from_slice(self.shared_keys.group.compress().as_bytes());
        out.extend_from_slice(&self.shared_keys.x_i.to_bytes());
        for vk in &self.vk_vec {
            out.extend_from_slice(vk.compress().as_bytes());
        }
        out
    }

    /// Restore a share blob, re-validating every structural and curve
    /// invariant. Any corruption of the blob is rejected here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidLocalKey> {
        if bytes.len() < 3 {
            return Err(InvalidLocalKey::Malformed);
        }
        if bytes[0] != SHARE_FORMAT_VERSION {
            return Err(InvalidLocalKey::UnsupportedVersion(bytes[0]));
        }
        let n = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        if n < 2 || bytes.len() != 3 + 2 * n + 64 + 32 * n {
            return Err(InvalidLocalKey::Malformed);
        }

        let mut at = 3;
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let id = u16::from_be_bytes([bytes[at], bytes[at + 1]]);
            ids.push(PartyId::new(id).ok_or(InvalidLocalKey::InvalidPeerSet)?);
            at += 2;
        }
        // the encoding is canonical: strictly ascending identities
        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(InvalidLocalKey::InvalidPeerSet);
        }
        let peers = PeerSet::new(ids).map_err(|_| InvalidLocalKey::InvalidPeerSet)?;

        let take32 = |at: &mut usize| {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&bytes[*at..*at + 32]);
            *at += 32;
            buf
        };
        let group = decode_point(&take32(&mut at)).map_err(InvalidLocalKey::InvalidCurveData)?;
        let x_i = decode_scalar(&take32(&mut at)).map_err(InvalidLocalKey::InvalidCurveData)?;
        let mut vk_vec = Vec::with_capacity(n);
        for _ in 0..n {
            vk_vec.push(decode_point(&take32(&mut at)).map_err(InvalidLocalKey::InvalidCurveData)?);
        }

        let vk_i = EdwardsPoint::mul_base(&x_i);
        let me = vk_vec
            .iter()
            .position(|vk| *vk == vk_i)
            .ok_or(InvalidLocalKey::VkDoesntIncludeSk)?;
        let i = peers.id_at(me);

        // interpolating the verification points must reproduce the group key
        let mut interpolated = EdwardsPoint::identity();
        for (pos, &k) in peers.ids().iter().enumerate() {
            let lambda = lagrange_coefficient(peers.ids(), k)
                .map_err(|_| InvalidLocalKey::InvalidPeerSet)?;
            interpolated += vk_vec[pos] * lambda;
        }
        if interpolated != group {
            return Err(InvalidLocalKey::InconsistentGroupKey);
        }

        Ok(LocalKey {
            shared_keys: SharedKeys { i, group, x_i },
            vk_vec,
            peers,
        })
    }
}

// Errors

type Result<T, E = ProceedError> = std::result::Result<T, E>;

/// Proceeding protocol error
///
/// Subset of [keygen errors](enum@super::Error) that can occur at protocol
/// proceeding (i.e. after every message was received and pre-validated).
#[derive(Debug, Error)]
pub enum ProceedError {
    #[error("round 2: opening of party {party} doesn't match its commitment: {error:?}")]
    Round2VerifyOpening { party: PartyId, error: crate::Error },
    #[error("round 3: share dealt by party {party} failed the feldman check: {error:?}")]
    Round3VerifyShare { party: PartyId, error: crate::Error },
    #[error("round 3: finalize local key: {0:?}")]
    Round3Finalize(crate::Error),
}

impl ProceedError {
    /// The peer this error incriminates, when there is one.
    pub fn culprit(&self) -> Option<PartyId> {
        match self {
            ProceedError::Round2VerifyOpening { party, .. }
            | ProceedError::Round3VerifyShare { party, .. } => Some(*party),
            ProceedError::Round3Finalize(_) => None,
        }
    }
}

/// Share blob rejected at [LocalKey::from_bytes]
#[derive(Debug, Error)]
pub enum InvalidLocalKey {
    #[error("share blob is malformed or truncated")]
    Malformed,
    #[error("unsupported share format version {0}")]
    UnsupportedVersion(u8),
    #[error("share blob carries an invalid peer set")]
    InvalidPeerSet,
    #[error("share blob carries invalid curve data: {0:?}")]
    InvalidCurveData(crate::Error),
    #[error("verification points don't include x_i G")]
    VkDoesntIncludeSk,
    #[error("verification points are inconsistent with the group key")]
    InconsistentGroupKey,
}
