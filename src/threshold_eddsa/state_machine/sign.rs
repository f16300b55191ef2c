//! High-level signing protocol implementation

use std::fmt;
use std::mem::replace;
use std::time::Duration;

use round_based::containers::*;
use round_based::{IsCritical, Msg, StateMachine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::basic_eddsa::EddsaSignature;
use crate::threshold_eddsa::party_i::{NonceCommit, NonceOpen, PartialSignature};
use crate::threshold_eddsa::state_machine::keygen::LocalKey;
use crate::threshold_eddsa::{PartyId, PeerSet};

mod rounds;
pub use rounds::ProceedError;
use rounds::{Round0, Round1, Round2, Round3};

/// Signing protocol state machine
///
/// Successfully completed signing protocol produces an [EddsaSignature] over
/// the 32-byte digest, verifiable under the group public key by any
/// standards-conformant Ed25519 verifier.
pub struct Sign {
    round: R,

    msgs1: Option<Store<BroadcastMsgs<NonceCommit>>>,
    msgs2: Option<Store<BroadcastMsgs<NonceOpen>>>,
    msgs3: Option<Store<BroadcastMsgs<PartialSignature>>>,

    msgs_queue: Vec<Msg<M>>,

    party_i: u16,
    party_n: u16,
}

impl Sign {
    /// Constructs a party of signing protocol
    ///
    /// Takes the digest to sign, this party's identity, the participating
    /// quorum (a subset of the keygen peer set containing the local identity),
    /// the threshold value the key was generated with, and the local key
    /// obtained at keygen.
    ///
    /// Returns error if:
    /// * the quorum has fewer than `t+1` members, returns [Error::TooFewParties]
    /// * the quorum is larger than the keygen peer set, returns [Error::TooManyParties]
    /// * the quorum is not a subset of the keygen peer set, returns [Error::QuorumOutsidePeerSet]
    /// * the local identity is not a quorum member, returns [Error::LocalPartyNotInQuorum]
    /// * the key belongs to another identity, returns [Error::MismatchedLocalKey]
    pub fn new(
        digest: [u8; 32],
        local: PartyId,
        quorum: PeerSet,
        t: u16,
        key: LocalKey,
    ) -> Result<Self> {
        let n = quorum.len() as u16;
        if key.id() != local {
            return Err(Error::MismatchedLocalKey);
        }
        if t == 0 {
            return Err(Error::InvalidThreshold);
        }
        if n < t + 1 {
            return Err(Error::TooFewParties);
        }
        if usize::from(n) > key.peers().len() {
            return Err(Error::TooManyParties);
        }
        if !quorum.is_subset_of(key.peers()) {
            return Err(Error::QuorumOutsidePeerSet);
        }
        let i = quorum
            .position(local)
            .map(|pos| pos as u16 + 1)
            .ok_or(Error::LocalPartyNotInQuorum)?;

        let mut state = Self {
            round: R::Round0(Round0 {
                key,
                quorum,
                digest,
                i,
            }),

            msgs1: Some(Round1::expects_messages(i, n)),
            msgs2: Some(Round2::expects_messages(i, n)),
            msgs3: Some(Round3::expects_messages(i, n)),

            msgs_queue: vec![],

            party_i: i,
            party_n: n,
        };

        state.proceed_round(false)?;
        Ok(state)
    }

    /// Proceeds round state if it received enough messages and if it's cheap to compute or
    /// `may_block == true`
    fn proceed_round(&mut self, may_block: bool) -> Result<()> {
        let store1_wants_more = self.msgs1.as_ref().map(|s| s.wants_more()).unwrap_or(false);
        let store2_wants_more = self.msgs2.as_ref().map(|s| s.wants_more()).unwrap_or(false);
        let store3_wants_more = self.msgs3.as_ref().map(|s| s.wants_more()).unwrap_or(false);

        let next_state: R;
        let try_again: bool = match replace(&mut self.round, R::Gone) {
            R::Round0(round) if !round.is_expensive() || may_block => {
                next_state = round
                    .proceed(&mut self.msgs_queue)
                    .map(R::Round1)
                    .map_err(Error::ProceedRound)?;
                true
            }
            s @ R::Round0(_) => {
                next_state = s;
                false
            }
            R::Round1(round) if !store1_wants_more && (!round.is_expensive() || may_block) => {
                let store = self.msgs1.take().ok_or(InternalError::StoreGone)?;
                let msgs = store
                    .finish()
                    .map_err(InternalError::RetrieveRoundMessages)?;
                next_state = round
                    .proceed(msgs, &mut self.msgs_queue)
                    .map(R::Round2)
                    .map_err(Error::ProceedRound)?;
                true
            }
            s @ R::Round1(_) => {
                next_state = s;
                false
            }
            R::Round2(round) if !store2_wants_more && (!round.is_expensive() || may_block) => {
                let store = self.msgs2.take().ok_or(InternalError::StoreGone)?;
                let msgs = store
                    .finish()
                    .map_err(InternalError::RetrieveRoundMessages)?;
                next_state = round
                    .proceed(msgs, &mut self.msgs_queue)
                    .map(R::Round3)
                    .map_err(Error::ProceedRound)?;
                true
            }
            s @ R::Round2(_) => {
                next_state = s;
                false
            }
            R::Round3(round) if !store3_wants_more && (!round.is_expensive() || may_block) => {
                let store = self.msgs3.take().ok_or(InternalError::StoreGone)?;
                let msgs = store
                    .finish()
                    .map_err(InternalError::RetrieveRoundMessages)?;
                next_state = round
                    .proceed(msgs)
                    .map(R::Final)
                    .map_err(Error::ProceedRound)?;
                true
            }
            s @ R::Round3(_) => {
                next_state = s;
                false
            }
            s @ R::Final(_) | s @ R::Gone => {
                next_state = s;
                false
            }
        };

        self.round = next_state;
        if try_again {
            self.proceed_round(may_block)
        } else {
            Ok(())
        }
    }
}

impl StateMachine for Sign {
    type MessageBody = M;
    type Err = Error;
    type Output = EddsaSignature;

    fn handle_incoming(&mut self, msg: Msg<Self::MessageBody>) -> Result<()> {
        let current_round = self.current_round();

        match msg.body {
            M::Round1(m) => {
                let store = self
                    .msgs1
                    .as_mut()
                    .ok_or(Error::ReceivedOutOfOrderMessage {
                        current_round,
                        msg_round: 1,
                    })?;
                store
                    .push_msg(Msg {
                        sender: msg.sender,
                        receiver: msg.receiver,
                        body: m,
                    })
                    .map_err(Error::HandleMessage)?;
                self.proceed_round(false)
            }
            M::Round2(m) => {
                let store = self
                    .msgs2
                    .as_mut()
                    .ok_or(Error::ReceivedOutOfOrderMessage {
                        current_round,
                        msg_round: 2,
                    })?;
                store
                    .push_msg(Msg {
                        sender: msg.sender,
                        receiver: msg.receiver,
                        body: m,
                    })
                    .map_err(Error::HandleMessage)?;
                self.proceed_round(false)
            }
            M::Round3(m) => {
                let store = self
                    .msgs3
                    .as_mut()
                    .ok_or(Error::ReceivedOutOfOrderMessage {
                        current_round,
                        msg_round: 3,
                    })?;
                store
                    .push_msg(Msg {
                        sender: msg.sender,
                        receiver: msg.receiver,
                        body: m,
                    })
                    .map_err(Error::HandleMessage)?;
                self.proceed_round(false)
            }
        }
    }

    fn message_queue(&mut self) -> &mut Vec<Msg<Self::MessageBody>> {
        &mut self.msgs_queue
    }

    fn wants_to_proceed(&self) -> bool {
        let store1_wants_more = self.msgs1.as_ref().map(|s| s.wants_more()).unwrap_or(false);
        let store2_wants_more = self.msgs2.as_ref().map(|s| s.wants_more()).unwrap_or(false);
        let store3_wants_more = self.msgs3.as_ref().map(|s| s.wants_more()).unwrap_or(false);

        match &self.round {
            R::Round0(_) => true,
            R::Round1(_) => !store1_wants_more,
            R::Round2(_) => !store2_wants_more,
            R::Round3(_) => !store3_wants_more,
            R::Final(_) | R::Gone => false,
        }
    }

    fn proceed(&mut self) -> Result<()> {
        self.proceed_round(true)
    }

    fn round_timeout(&self) -> Option<Duration> {
        None
    }

    fn round_timeout_reached(&mut self) -> Self::Err {
        panic!("no timeout was set")
    }

    fn is_finished(&self) -> bool {
        matches!(self.round, R::Final(_))
    }

    fn pick_output(&mut self) -> Option<Result<Self::Output>> {
        match self.round {
            R::Final(_) => (),
            R::Gone => return Some(Err(Error::DoublePickResult)),
            _ => return None,
        }

        match replace(&mut self.round, R::Gone) {
            R::Final(result) => Some(Ok(result)),
            _ => unreachable!("guaranteed by match expression above"),
        }
    }

    fn current_round(&self) -> u16 {
        match &self.round {
            R::Round0(_) => 0,
            R::Round1(_) => 1,
            R::Round2(_) => 2,
            R::Round3(_) => 3,
            R::Final(_) | R::Gone => 4,
        }
    }

    fn total_rounds(&self) -> Option<u16> {
        Some(3)
    }

    fn party_ind(&self) -> u16 {
        self.party_i
    }

    fn parties(&self) -> u16 {
        self.party_n
    }
}

impl fmt::Debug for Sign {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let current_round = match &self.round {
            R::Round0(_) => "0",
            R::Round1(_) => "1",
            R::Round2(_) => "2",
            R::Round3(_) => "3",
            R::Final(_) => "[Final]",
            R::Gone => "[Gone]",
        };
        let msgs1 = match self.msgs1.as_ref() {
            Some(msgs) => format!("[{}/{}]", msgs.messages_received(), msgs.messages_total()),
            None => "[None]".into(),
        };
        let msgs2 = match self.msgs2.as_ref() {
            Some(msgs) => format!("[{}/{}]", msgs.messages_received(), msgs.messages_total()),
            None => "[None]".into(),
        };
        let msgs3 = match self.msgs3.as_ref() {
            Some(msgs) => format!("[{}/{}]", msgs.messages_received(), msgs.messages_total()),
            None => "[None]".into(),
        };
        write!(
            f,
            "{{Sign at round={} msgs1={} msgs2={} msgs3={} queue=[len={}]}}",
            current_round,
            msgs1,
            msgs2,
            msgs3,
            self.msgs_queue.len()
        )
    }
}

// Rounds

enum R {
    Round0(Round0),
    Round1(Round1),
    Round2(Round2),
    Round3(Round3),
    Final(EddsaSignature),
    Gone,
}

// Messages

/// Signing protocol message, one variant per wire round: nonce commitment,
/// nonce opening, partial signature. All three travel as broadcasts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum M {
    Round1(NonceCommit),
    Round2(NonceOpen),
    Round3(PartialSignature),
}

// Errors

type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type of signing protocol
#[derive(Debug, Error)]
pub enum Error {
    /// Round proceeding resulted in error
    #[error("proceed round: {0}")]
    ProceedRound(#[source] ProceedError),

    /// Too few parties involved in protocol (less than `threshold+1`), signing is not possible
    #[error("at least t+1 parties must be involved in protocol")]
    TooFewParties,
    /// Number of parties involved in signing is more than number of parties holding a key
    #[error("number of parties involved in signing is more than number of parties holding a key")]
    TooManyParties,
    /// Threshold value `t` is zero
    #[error("threshold is not in range [1; n-1]")]
    InvalidThreshold,
    /// The quorum contains an identity that never took part in keygen
    #[error("quorum is not a subset of the keygen peer set")]
    QuorumOutsidePeerSet,
    /// The local identity is missing from the quorum
    #[error("local party is not a member of the quorum")]
    LocalPartyNotInQuorum,
    /// The provided local key was generated by a different identity
    #[error("local key belongs to a different party")]
    MismatchedLocalKey,

    /// Received message didn't pass pre-validation
    #[error("received message didn't pass pre-validation: {0}")]
    HandleMessage(#[source] StoreErr),
    /// Received message which we didn't expect to receive now (e.g. message from previous round)
    #[error(
        "didn't expect to receive message from round {msg_round} (being at round {current_round})"
    )]
    ReceivedOutOfOrderMessage { current_round: u16, msg_round: u16 },
    /// [Sign::pick_output] called twice
    #[error("pick_output called twice")]
    DoublePickResult,

    /// Some internal assertions were failed, which is a bug
    #[error("internal error: {0:?}")]
    InternalError(InternalError),
}

impl IsCritical for Error {
    fn is_critical(&self) -> bool {
        true
    }
}

impl From<InternalError> for Error {
    fn from(err: InternalError) -> Self {
        Self::InternalError(err)
    }
}

use private::InternalError;
mod private {
    #[derive(Debug)]
    #[non_exhaustive]
    pub enum InternalError {
        /// [Messages store](super::MessageStore) reported that it received all messages it wanted
        /// to receive, but refused to return message container
        RetrieveRoundMessages(super::StoreErr),
        #[doc(hidden)]
        StoreGone,
    }
}
