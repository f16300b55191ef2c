//! On-wire framing shared with the transport.
//!
//! Every frame is `protocol (1) || round (1) || epoch (2, BE) || sender (2, BE)
//! || flags (1, bit 0 = broadcast) || recipient (2, BE, zero when broadcast)
//! || payload length (4, BE) || payload`. Payloads carry curve points as
//! 32-byte compressed Edwards encodings and scalars as 32-byte canonical
//! little-endian; every point and scalar is fully validated on decode.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use thiserror::Error;

use crate::threshold_eddsa::party_i::{
    KeyGenCommit, KeyGenOpen, NonceCommit, NonceOpen, PartialSignature, SecretShareMsg,
};
use crate::threshold_eddsa::state_machine::{keygen, sign};
use crate::threshold_eddsa::utilities::{decode_point, decode_scalar, DlogProof};
use crate::threshold_eddsa::vss::VerifiableSS;
use crate::threshold_eddsa::PartyId;

pub const PROTOCOL_KEYGEN: u8 = 0x01;
pub const PROTOCOL_SIGN: u8 = 0x02;

const HEADER_LEN: usize = 13;
const FLAG_BROADCAST: u8 = 0b0000_0001;

/// A protocol message that knows its place in the wire format.
pub trait WireMessage: Sized {
    const PROTOCOL: u8;

    /// Wire round tag of this message.
    fn round(&self) -> u8;
    /// Whether this message travels as a broadcast.
    fn is_broadcast(&self) -> bool;
    fn encode_payload(&self) -> Vec<u8>;
    fn decode_payload(round: u8, broadcast: bool, payload: &[u8]) -> Result<Self, FrameError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u8,
    pub round: u8,
    pub epoch: u16,
    pub sender: PartyId,
    pub broadcast: bool,
    pub recipient: Option<PartyId>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn for_message<M: WireMessage>(
        body: &M,
        epoch: u16,
        sender: PartyId,
        recipient: Option<PartyId>,
    ) -> Frame {
        Frame {
            protocol: M::PROTOCOL,
            round: body.round(),
            epoch,
            sender,
            broadcast: recipient.is_none(),
            recipient,
            payload: body.encode_payload(),
        }
    }

    /// Decode the payload as a message of protocol `M`.
    pub fn open<M: WireMessage>(&self) -> Result<M, FrameError> {
        if self.protocol != M::PROTOCOL {
            return Err(FrameError::BadProtocolTag(self.protocol));
        }
        M::decode_payload(self.round, self.broadcast, &self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.protocol);
        out.push(self.round);
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.sender.get().to_be_bytes());
        out.push(if self.broadcast { FLAG_BROADCAST } else { 0 });
        let recipient = self.recipient.map(|id| id.get()).unwrap_or(0);
        out.extend_from_slice(&recipient.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let protocol = bytes[0];
        if protocol != PROTOCOL_KEYGEN && protocol != PROTOCOL_SIGN {
            return Err(FrameError::BadProtocolTag(protocol));
        }
        let round = bytes[1];
        if !(0x01..=0x03).contains(&round) {
            return Err(FrameError::BadRoundTag(round));
        }
        let epoch = u16::from_be_bytes([bytes[2], bytes[3]]);
        let sender = PartyId::new(u16::from_be_bytes([bytes[4], bytes[5]]))
            .ok_or(FrameError::BadSender)?;
        let flags = bytes[6];
        if flags & !FLAG_BROADCAST != 0 {
            return Err(FrameError::BadFlags(flags));
        }
        let broadcast = flags & FLAG_BROADCAST != 0;
        let recipient_raw = u16::from_be_bytes([bytes[7], bytes[8]]);
        let recipient = match (broadcast, PartyId::new(recipient_raw)) {
            (true, None) => None,
            (false, Some(id)) => Some(id),
            _ => return Err(FrameError::BadRecipient),
        };
        let payload_len = u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]) as usize;
        if bytes.len() - HEADER_LEN != payload_len {
            return Err(FrameError::LengthMismatch);
        }

        Ok(Frame {
            protocol,
            round,
            epoch,
            sender,
            broadcast,
            recipient,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

impl WireMessage for keygen::M {
    const PROTOCOL: u8 = PROTOCOL_KEYGEN;

    fn round(&self) -> u8 {
        // the opening and the dealt share both belong to wire round 2; the
        // broadcast flag tells them apart
        match self {
            Self::Round1(_) => 1,
            Self::Round2(_) | Self::Round3(_) => 2,
        }
    }

    fn is_broadcast(&self) -> bool {
        !matches!(self, Self::Round3(_))
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Round1(commit) => commit.com.to_vec(),
            Self::Round2(open) => {
                let count = open.vss.commitments.len();
                let mut out = Vec::with_capacity(2 + 32 * count + 96);
                out.extend_from_slice(&(count as u16).to_be_bytes());
                for point in &open.vss.commitments {
                    out.extend_from_slice(point.compress().as_bytes());
                }
                out.extend_from_slice(&open.blind);
                out.extend_from_slice(open.pok.commitment.compress().as_bytes());
                out.extend_from_slice(&open.pok.response.to_bytes());
                out
            }
            Self::Round3(share) => share.share.to_bytes().to_vec(),
        }
    }

    fn decode_payload(round: u8, broadcast: bool, payload: &[u8]) -> Result<Self, FrameError> {
        match (round, broadcast) {
            (1, true) => {
                let mut r = Reader::new(payload);
                let com = r.array32()?;
                r.finish()?;
                Ok(Self::Round1(KeyGenCommit { com }))
            }
            (2, true) => {
                let mut r = Reader::new(payload);
                let count = r.u16()?;
                if count < 2 {
                    return Err(FrameError::LengthMismatch);
                }
                let mut commitments = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    commitments.push(r.point()?);
                }
                let blind = r.array32()?;
                let pok = DlogProof {
                    commitment: r.point()?,
                    response: r.scalar()?,
                };
                r.finish()?;
                Ok(Self::Round2(KeyGenOpen {
                    vss: VerifiableSS { commitments },
                    blind,
                    pok,
                }))
            }
            (2, false) => {
                let mut r = Reader::new(payload);
                let share = r.scalar()?;
                r.finish()?;
                Ok(Self::Round3(SecretShareMsg { share }))
            }
            _ => Err(FrameError::BadRoundTag(round)),
        }
    }
}

impl WireMessage for sign::M {
    const PROTOCOL: u8 = PROTOCOL_SIGN;

    fn round(&self) -> u8 {
        match self {
            Self::Round1(_) => 1,
            Self::Round2(_) => 2,
            Self::Round3(_) => 3,
        }
    }

    fn is_broadcast(&self) -> bool {
        true
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Round1(commit) => commit.com.to_vec(),
            Self::Round2(open) => {
                let mut out = Vec::with_capacity(64);
                out.extend_from_slice(open.R_i.compress().as_bytes());
                out.extend_from_slice(&open.salt);
                out
            }
            Self::Round3(partial) => partial.s_i.to_bytes().to_vec(),
        }
    }

    fn decode_payload(round: u8, broadcast: bool, payload: &[u8]) -> Result<Self, FrameError> {
        if !broadcast {
            return Err(FrameError::BadRoundTag(round));
        }
        match round {
            1 => {
                let mut r = Reader::new(payload);
                let com = r.array32()?;
                r.finish()?;
                Ok(Self::Round1(NonceCommit { com }))
            }
            2 => {
                let mut r = Reader::new(payload);
                let R_i = r.point()?;
                let salt = r.array32()?;
                r.finish()?;
                Ok(Self::Round2(NonceOpen { R_i, salt }))
            }
            3 => {
                let mut r = Reader::new(payload);
                let s_i = r.scalar()?;
                r.finish()?;
                Ok(Self::Round3(PartialSignature { s_i }))
            }
            _ => Err(FrameError::BadRoundTag(round)),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, at: 0 }
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        if self.bytes.len() - self.at < 2 {
            return Err(FrameError::Truncated);
        }
        let value = u16::from_be_bytes([self.bytes[self.at], self.bytes[self.at + 1]]);
        self.at += 2;
        Ok(value)
    }

    fn array32(&mut self) -> Result<[u8; 32], FrameError> {
        if self.bytes.len() - self.at < 32 {
            return Err(FrameError::Truncated);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.bytes[self.at..self.at + 32]);
        self.at += 32;
        Ok(out)
    }

    fn point(&mut self) -> Result<EdwardsPoint, FrameError> {
        decode_point(&self.array32()?).map_err(|_| FrameError::InvalidPoint)
    }

    fn scalar(&mut self) -> Result<Scalar, FrameError> {
        decode_scalar(&self.array32()?).map_err(|_| FrameError::InvalidScalar)
    }

    fn finish(self) -> Result<(), FrameError> {
        if self.at == self.bytes.len() {
            Ok(())
        } else {
            Err(FrameError::LengthMismatch)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is truncated")]
    Truncated,
    #[error("unknown protocol tag {0:#04x}")]
    BadProtocolTag(u8),
    #[error("unknown round tag {0:#04x}")]
    BadRoundTag(u8),
    #[error("unknown flag bits {0:#010b}")]
    BadFlags(u8),
    #[error("zero sender identity")]
    BadSender,
    #[error("broadcast flag and recipient field disagree")]
    BadRecipient,
    #[error("payload length doesn't match the frame size")]
    LengthMismatch,
    #[error("payload carries an invalid curve point")]
    InvalidPoint,
    #[error("payload carries a non-canonical scalar")]
    InvalidScalar,
}
