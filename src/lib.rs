//! ## How to use it
//! The library implements dealer-less distributed key generation and
//! cooperative signing for Ed25519. Each validator runs a [Party] which owns
//! the protocol state machines; you connect it to your transport through a
//! pair of message channels and drive one session at a time.
//!
//! [Party]: threshold_eddsa::party::Party
//!
//! Messages delivery should meet security assumptions:
//! * Any P2P message must be encrypted so no one can read it except recipient
//! * Broadcast messages must be signed, so no one can forge message sender
//!
//! ### Keygen + Sign
//! ```no_run
//! use eddsa::threshold_eddsa::party::{cancel_pair, OutboundFrame, Party, SessionOptions};
//! use eddsa::threshold_eddsa::{PartyId, PeerSet};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let id = PartyId::new(1).unwrap();
//! let peers = PeerSet::new(vec![
//!     PartyId::new(1).unwrap(),
//!     PartyId::new(2).unwrap(),
//!     PartyId::new(3).unwrap(),
//! ]).unwrap();
//!
//! let party = Party::new(id);
//!
//! // The transport drains `to_transport` and must deliver every inbound
//! // frame through `party.on_message(bytes, from, broadcast)`.
//! let (outgoing, mut to_transport) = tokio::sync::mpsc::channel::<OutboundFrame>(16);
//! # tokio::spawn(async move { while to_transport.recv().await.is_some() {} });
//!
//! party.init(peers.clone(), 2, outgoing.clone())?;
//! let (_cancel, token) = cancel_pair();
//! let local_key = party.run_dkg(token, SessionOptions::default()).await?;
//!
//! // ... persist `local_key.to_bytes()`, later restore it with `set_share`
//! // and run a signing session over a quorum subset of `peers`.
//! party.init(peers, 2, outgoing)?;
//! let (_cancel, token) = cancel_pair();
//! let signature = party.run_sign(token, [0u8; 32], SessionOptions::default()).await?;
//! println!("signature: {:?}", signature.to_bytes().to_vec());
//! # Ok(())
//! # }
//! ```

pub mod basic_eddsa;
pub mod threshold_eddsa;
/// Signature verification follows the Ed25519 standard:
/// [https://tools.ietf.org/html/rfc8032]
/// Anything this library outputs therefore verifies under any conformant
/// Ed25519 verifier, and the group public key is a plain 32-byte Ed25519 key.

#[derive(Copy, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    InvalidPeerSet,
    InvalidPoint,
    InvalidScalar,
    KeyGenMismatchedVectors,
    KeyGenBadCommitment,
    KeyGenBadProofOfKnowledge,
    KeyGenInvalidShare,
    KeyGenInconsistentKey,
    SignMismatchedVectors,
    SignBadNonceCommitment,
    SignInvalidPartialSignature,
    SignInvalidSignature,
}
